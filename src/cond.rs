//! # Priority-ordered condition variable
//!
//! Bound to exactly one [PiMutex] for its whole life. A wait:
//! 1. validates the deadline, then checks the caller owns the mutex
//! 2. queues the caller on the condition while it still holds the mutex, so no signal can slip
//!    in between: signalers are expected to hold the mutex too
//! 3. releases the mutex through the normal unlock path (which may hand it to a mutex waiter)
//! 4. sleeps on its own queue entry until a signal marks it woken, the deadline passes or
//!    it gets cancelled
//! 5. re-acquires the mutex through the normal contended lock path before returning, also on timeout
//!
//! There are no spurious wakeups: a waiter returns only after a signal/broadcast picked *its* entry,
//! its deadline passed, or it was cancelled. Timeout/cancellation and a signal race on the same
//! queue entry (see [crate::wait_queue]); if the signal wins the wait returns normally and a
//! pending cancellation is left for the next cancellation point.
//!
//! `signal` picks the highest priority, earliest arrived waiter, the same policy the mutex uses
//! for handoff. `broadcast` wakes everybody; they then line up on the mutex in its own order.
//!
//! ## Binding
//!
//! A condition initialized at runtime stores the mutex as a byte offset from itself, which stays
//! valid in every process mapping both objects (at whatever address). A `static` condition bound
//! with [PiCond::new] keeps a plain pointer, as statics are process-private anyway.

use std::fmt;
use std::ptr;
use std::sync::atomic::{
    AtomicIsize, AtomicPtr, AtomicU32,
    Ordering::{Acquire, Relaxed, Release},
};

use bitflags::bitflags;

use crate::cancel;
use crate::error::{Error, Result};
use crate::futex;
use crate::mutex::PiMutex;
use crate::raw_lock::RawLock;
use crate::sched::{OsScheduler, Scheduler};
use crate::shared::ProcessShared;
use crate::time::Timespec;
use crate::wait_queue::{WaitQueue, WAITING};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CondFlags: u32 {
        /// may be placed in memory shared between processes; the mutex has to be shared as well
        const PSHARED = 1;
    }
}

/// "picv"
const COND_MAGIC: u32 = 0x7069_6376;

#[repr(C)]
pub struct PiCond {
    magic: AtomicU32,
    flags: AtomicU32,
    guard: RawLock,
    /// mutex address minus own address, 0 if bound statically
    mutex_offset: AtomicIsize,
    /// only used by statically bound, process-private conditions
    static_mutex: AtomicPtr<PiMutex>,
    queue: WaitQueue,
}

// SAFETY: atomics only; shared instances are bound through the offset, the pointer stays null.
// All zeroes reads as "uninitialized".
unsafe impl ProcessShared for PiCond {}

enum Wakeup {
    Signaled,
    TimedOut,
    Cancelled,
}

impl PiCond {
    /// A ready, process-private condition bound to a `static` mutex.
    pub const fn new(mutex: &'static PiMutex) -> Self {
        Self {
            magic: AtomicU32::new(COND_MAGIC),
            flags: AtomicU32::new(0),
            guard: RawLock::new(),
            mutex_offset: AtomicIsize::new(0),
            static_mutex: AtomicPtr::new(mutex as *const PiMutex as *mut PiMutex),
            queue: WaitQueue::new(),
        }
    }

    /// Binds the condition to `mutex`, in place.
    ///
    /// Fails with [Error::InvalidArgument] if `mutex` isn't initialized or the shared flags
    /// of both don't match, with [Error::Busy] if threads still wait on the condition.
    ///
    /// # Safety
    ///
    /// `mutex` must stay alive and must not move relative to `self` for as long as the condition is used.
    /// For shared instances both must be in the same mapping in every process using them.
    pub unsafe fn init(&self, mutex: &PiMutex, flags: CondFlags) -> Result<()> {
        mutex.check()?;
        if flags.contains(CondFlags::PSHARED) != mutex.is_shared() {
            return Err(Error::InvalidArgument);
        }
        if self.magic.load(Acquire) == COND_MAGIC && !self.queue.is_idle() {
            return Err(Error::Busy);
        }
        let offset = (mutex as *const PiMutex as isize).wrapping_sub(self as *const Self as isize);
        self.flags.store(flags.bits(), Relaxed);
        self.guard.reset();
        self.queue.reset();
        self.mutex_offset.store(offset, Relaxed);
        self.static_mutex.store(ptr::null_mut(), Relaxed);
        self.magic.store(COND_MAGIC, Release);
        Ok(())
    }

    fn mutex(&self) -> Result<&PiMutex> {
        let offset = self.mutex_offset.load(Relaxed);
        let mutex = if offset != 0 {
            (self as *const Self as *const u8).wrapping_offset(offset) as *const PiMutex
        } else {
            self.static_mutex.load(Relaxed) as *const PiMutex
        };
        // SAFETY: set up by `new` from a 'static reference or by `init`,
        // whose contract keeps the mutex alive at that offset
        unsafe { mutex.as_ref() }.ok_or(Error::InvalidArgument)
    }

    pub fn wait(&self) -> Result<()> {
        self.wait_with(&OsScheduler)
    }

    pub fn wait_with<S: Scheduler + ?Sized>(&self, sched: &S) -> Result<()> {
        self.wait_until(sched, None)
    }

    /// [PiCond::wait] bounded by an absolute CLOCK_MONOTONIC `deadline`.
    ///
    /// A malformed deadline is reported before anything else, ownership included.
    /// On [Error::TimedOut] the mutex is held again, as after a normal wakeup.
    pub fn timed_wait(&self, deadline: &Timespec) -> Result<()> {
        self.timed_wait_with(&OsScheduler, deadline)
    }

    pub fn timed_wait_with<S: Scheduler + ?Sized>(&self, sched: &S, deadline: &Timespec) -> Result<()> {
        if !deadline.is_valid() {
            return Err(Error::InvalidArgument);
        }
        self.wait_until(sched, Some(deadline))
    }

    fn wait_until<S: Scheduler + ?Sized>(&self, sched: &S, deadline: Option<&Timespec>) -> Result<()> {
        self.check()?;
        let mutex = self.mutex()?;
        let me = sched.current_tid();
        if !mutex.is_owned_by(me) {
            return Err(Error::NotOwner);
        }

        // a pending request acts before we ever queue
        cancel::test_cancel();
        if deadline.is_some_and(Timespec::has_passed) {
            return Err(Error::TimedOut);
        }

        let shared = self.is_shared();
        // queued at the priority we'll have once the mutex's waiters stop boosting us
        let priority = mutex.settled_priority(sched, me);
        let index = {
            let _guard = self.guard.lock(shared);
            self.queue.enqueue(me, priority).ok_or(Error::Again)?
        };
        if let Err(e) = mutex.unlock_with(sched) {
            self.queue.withdraw(index);
            return Err(e);
        }

        let wakeup = self.sleep(index, deadline, shared);
        mutex.lock_with(sched)?;

        match wakeup {
            Wakeup::Signaled => Ok(()),
            Wakeup::TimedOut => {
                log::debug!("thread {me} timed out on condition {:p}", self);
                Err(Error::TimedOut)
            }
            Wakeup::Cancelled => {
                // unwinds, the mutex is ours again
                cancel::test_cancel();
                Ok(())
            }
        }
    }

    /// Blocks on entry `index` and takes it out of the queue, exactly once.
    fn sleep(&self, index: u32, deadline: Option<&Timespec>, shared: bool) -> Wakeup {
        let word = self.queue.state_word(index);
        let parked = cancel::park(word, shared);
        let wakeup = loop {
            if !self.queue.is_waiting(index) {
                break Wakeup::Signaled;
            }
            if cancel::is_requested() {
                break Wakeup::Cancelled;
            }
            if !futex::wait(word, WAITING, deadline, shared) {
                break Wakeup::TimedOut;
            }
        };
        drop(parked);

        match wakeup {
            Wakeup::Signaled => {
                self.queue.release(index);
                Wakeup::Signaled
            }
            _ if self.queue.withdraw(index) => wakeup,
            // a signal picked us in the meantime, it must not get lost
            _ => Wakeup::Signaled,
        }
    }

    /// Wakes the highest priority, earliest arrived waiter, if any.
    pub fn signal(&self) -> Result<()> {
        self.check()?;
        let shared = self.is_shared();
        let woken = {
            let _guard = self.guard.lock(shared);
            self.queue.dequeue_highest()
        };
        if let Some(waiter) = woken {
            log::trace!("condition {:p} signals thread {}", self, waiter.tid);
            futex::wake(self.queue.state_word(waiter.index), 1, shared);
        }
        Ok(())
    }

    /// Wakes every current waiter.
    pub fn broadcast(&self) -> Result<()> {
        self.check()?;
        let shared = self.is_shared();
        let mut woken = {
            let _guard = self.guard.lock(shared);
            self.queue.dequeue_all()
        };
        while woken != 0 {
            let index = woken.trailing_zeros();
            futex::wake(self.queue.state_word(index), 1, shared);
            woken &= woken - 1;
        }
        Ok(())
    }

    /// Fails with [Error::Busy] while threads wait on the condition.
    pub fn destroy(&self) -> Result<()> {
        self.check()?;
        let _guard = self.guard.lock(self.is_shared());
        if !self.queue.is_idle() {
            return Err(Error::Busy);
        }
        self.magic.store(0, Release);
        Ok(())
    }

    /// Threads blocked in `wait`/`timed_wait` and not signaled yet.
    pub fn waiters(&self) -> usize {
        self.queue.len()
    }

    pub fn is_shared(&self) -> bool {
        CondFlags::from_bits_truncate(self.flags.load(Relaxed)).contains(CondFlags::PSHARED)
    }

    fn check(&self) -> Result<()> {
        if self.magic.load(Acquire) == COND_MAGIC {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }
}

impl fmt::Debug for PiCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PiCond")
            .field("initialized", &self.check().is_ok())
            .field("waiters", &self.waiters())
            .field("shared", &self.is_shared())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{mpsc, Arc, Barrier, Mutex};
    use std::thread::{self, scope, sleep};
    use std::time::Duration;

    use super::*;
    use crate::mutex::MutexFlags;
    use crate::sched::gettid;
    use crate::wait_queue::test::FakeScheduler;

    fn wait_for_waiters(c: &PiCond, n: usize) {
        while c.waiters() < n {
            sleep(Duration::from_millis(1));
        }
    }

    fn bound() -> (Box<PiMutex>, Box<PiCond>) {
        static DUMMY: PiMutex = PiMutex::new();
        let m = Box::new(PiMutex::new());
        let c = Box::new(PiCond::new(&DUMMY));
        unsafe { c.init(&m, CondFlags::empty()) }.unwrap();
        (m, c)
    }

    #[test]
    fn malformed_deadline_wins_over_ownership() {
        static M: PiMutex = PiMutex::new();
        static C: PiCond = PiCond::new(&M);
        let mut ts = Timespec::now();
        ts.nsec = -1;
        assert_eq!(C.timed_wait(&ts), Err(Error::InvalidArgument));
        ts.nsec = 2_000_000_000;
        assert_eq!(C.timed_wait(&ts), Err(Error::InvalidArgument));

        // same when holding the mutex, and nothing blocks
        M.lock().unwrap();
        ts.nsec = 1_000_000_000;
        assert_eq!(C.timed_wait(&ts), Err(Error::InvalidArgument));
        assert_eq!(M.owner(), Some(gettid()));
        M.unlock().unwrap();
    }

    #[test]
    fn waiting_without_the_mutex_is_refused() {
        static M: PiMutex = PiMutex::new();
        static C: PiCond = PiCond::new(&M);
        let far = Timespec::after(Duration::from_secs(1000));
        assert_eq!(C.wait(), Err(Error::NotOwner));
        assert_eq!(C.timed_wait(&far), Err(Error::NotOwner));

        // owned by somebody else is no better
        M.lock().unwrap();
        thread::spawn(move || {
            assert_eq!(C.wait(), Err(Error::NotOwner));
            assert_eq!(C.timed_wait(&far), Err(Error::NotOwner));
        })
        .join()
        .unwrap();
        M.unlock().unwrap();
        assert_eq!(C.waiters(), 0);
    }

    #[test]
    fn single_signal_wakes_the_waiter_once() {
        static M: PiMutex = PiMutex::new();
        static C: PiCond = PiCond::new(&M);
        M.lock().unwrap();
        let child = thread::spawn(|| {
            M.lock().unwrap();
            C.signal().unwrap();
            M.unlock().unwrap();
        });
        C.wait().unwrap();
        // back with the mutex
        assert_eq!(M.owner(), Some(gettid()));
        child.join().unwrap();
        M.unlock().unwrap();
        assert_eq!(C.waiters(), 0);
        C.destroy().unwrap();
        M.destroy().unwrap();
    }

    #[test]
    fn broadcast_wakes_all_and_they_reacquire_one_by_one() {
        const N: usize = 10;
        let (m, c) = bound();
        let barrier = Barrier::new(2);
        let acquisitions = AtomicUsize::new(0);
        scope(|s| {
            for _ in 0..N {
                s.spawn(|| {
                    m.lock().unwrap();
                    barrier.wait();
                    c.wait().unwrap();
                    acquisitions.fetch_add(1, Relaxed);
                    m.unlock().unwrap();
                });
                // the child holds the mutex until it waits, so it's queued once we get it
                barrier.wait();
            }
            m.lock().unwrap();
            assert_eq!(c.waiters(), N);
            c.broadcast().unwrap();
            assert_eq!(c.waiters(), 0);
            m.unlock().unwrap();
        });
        assert_eq!(acquisitions.load(Relaxed), N);
        assert!(!m.is_locked());
        c.destroy().unwrap();
    }

    #[test]
    fn more_waiters_never_wake_existing_ones() {
        const N: usize = 10;
        let (m, c) = bound();
        let returned = AtomicUsize::new(0);
        scope(|s| {
            for i in 0..N {
                s.spawn(|| {
                    m.lock().unwrap();
                    c.wait().unwrap();
                    returned.fetch_add(1, Relaxed);
                    m.unlock().unwrap();
                });
                wait_for_waiters(&c, i + 1);
            }
            sleep(Duration::from_millis(200));
            assert_eq!(returned.load(Relaxed), 0);

            m.lock().unwrap();
            c.broadcast().unwrap();
            m.unlock().unwrap();
        });
        assert_eq!(returned.load(Relaxed), N);
    }

    #[test]
    fn signal_picks_highest_priority_then_earliest() {
        let sched = FakeScheduler::default();
        let (m, c) = bound();
        let order = Mutex::new(Vec::new());
        scope(|s| {
            for (queued, priority) in [5, 20, 20, 1].into_iter().enumerate() {
                let (sched, m, c, order) = (&sched, &m, &c, &order);
                s.spawn(move || {
                    sched.assign(gettid(), priority);
                    m.lock_with(sched).unwrap();
                    c.wait_with(sched).unwrap();
                    order.lock().unwrap().push((priority, queued));
                    m.unlock_with(sched).unwrap();
                });
                wait_for_waiters(&c, queued + 1);
            }
            for woken in 1..=4 {
                m.lock_with(&sched).unwrap();
                c.signal().unwrap();
                m.unlock_with(&sched).unwrap();
                while order.lock().unwrap().len() < woken {
                    sleep(Duration::from_millis(1));
                }
            }
        });
        assert_eq!(*order.lock().unwrap(), vec![(20, 1), (20, 2), (5, 0), (1, 3)]);
    }

    #[test]
    fn signal_wakes_at_most_one() {
        let (m, c) = bound();
        let returned = AtomicUsize::new(0);
        scope(|s| {
            for i in 0..3 {
                s.spawn(|| {
                    m.lock().unwrap();
                    c.wait().unwrap();
                    returned.fetch_add(1, Relaxed);
                    m.unlock().unwrap();
                });
                wait_for_waiters(&c, i + 1);
            }
            m.lock().unwrap();
            c.signal().unwrap();
            m.unlock().unwrap();
            while returned.load(Relaxed) < 1 {
                sleep(Duration::from_millis(1));
            }
            sleep(Duration::from_millis(100));
            assert_eq!(returned.load(Relaxed), 1);
            assert_eq!(c.waiters(), 2);

            m.lock().unwrap();
            c.broadcast().unwrap();
            m.unlock().unwrap();
        });
    }

    #[test]
    fn signal_without_waiters_is_a_no_op() {
        let (m, c) = bound();
        c.signal().unwrap();
        c.broadcast().unwrap();
        assert!(!m.is_locked());
    }

    #[test]
    fn timeout_returns_with_the_mutex() {
        let (m, c) = bound();
        m.lock().unwrap();
        let deadline = Timespec::after(Duration::from_millis(50));
        assert_eq!(c.timed_wait(&deadline), Err(Error::TimedOut));
        assert!(deadline.has_passed());
        assert_eq!(m.owner(), Some(gettid()));
        assert_eq!(c.waiters(), 0);

        // already passed: no blocking at all
        assert_eq!(c.timed_wait(&Timespec::new(0, 0)), Err(Error::TimedOut));
        m.unlock().unwrap();
        c.destroy().unwrap();
    }

    #[test]
    fn timed_wait_is_woken_before_the_deadline() {
        let (m, c) = bound();
        let flag = AtomicBool::new(false);
        m.lock().unwrap();
        scope(|s| {
            s.spawn(|| {
                m.lock().unwrap();
                flag.store(true, Relaxed);
                c.signal().unwrap();
                m.unlock().unwrap();
            });
            let deadline = Timespec::after(Duration::from_secs(30));
            while !flag.load(Relaxed) {
                c.timed_wait(&deadline).unwrap();
            }
            m.unlock().unwrap();
        });
    }

    #[test]
    fn cancelled_waiter_leaves_the_mutex_free() {
        static M: PiMutex = PiMutex::new();
        static C: PiCond = PiCond::new(&M);
        let barrier = Arc::new(Barrier::new(2));
        let (tx, rx) = mpsc::channel();

        let b = barrier.clone();
        let waiter = thread::spawn(move || {
            tx.send(cancel::handle()).unwrap();
            let _unlock = M.lock_guard().unwrap();
            b.wait();
            // only cancellation gets us out of here
            loop {
                C.wait().unwrap();
            }
        });
        let handle = rx.recv().unwrap();
        barrier.wait();

        M.lock().unwrap();
        C.signal().unwrap();
        handle.cancel();
        M.unlock().unwrap();

        let payload = waiter.join().unwrap_err();
        assert!(cancel::is_cancelled(payload.as_ref()));
        assert!(!M.is_locked());
        assert_eq!(C.waiters(), 0);
        M.try_lock().unwrap();
        M.unlock().unwrap();
    }

    #[test]
    fn signalled_waiter_without_request_carries_on() {
        static M: PiMutex = PiMutex::new();
        static C: PiCond = PiCond::new(&M);
        static DONE: AtomicBool = AtomicBool::new(false);
        let barrier = Arc::new(Barrier::new(2));

        let b = barrier.clone();
        let waiter = thread::spawn(move || {
            let _unlock = M.lock_guard().unwrap();
            b.wait();
            while !DONE.load(Relaxed) {
                C.wait().unwrap();
            }
            cancel::is_requested()
        });
        barrier.wait();

        M.lock().unwrap();
        DONE.store(true, Relaxed);
        C.signal().unwrap();
        M.unlock().unwrap();

        assert_eq!(waiter.join().ok(), Some(false));
        assert!(!M.is_locked());
        assert_eq!(C.waiters(), 0);
    }

    #[test]
    fn boosted_waiter_queues_at_its_own_priority() {
        let sched = FakeScheduler::default();
        let (m, c) = bound();
        let order = Mutex::new(Vec::new());
        scope(|s| {
            let (sched, m, c, order) = (&sched, &m, &c, &order);
            let wait_once = move |priority| {
                sched.assign(gettid(), priority);
                m.lock_with(sched).unwrap();
                if priority == 1 {
                    // boosted to 10 until it lets go of the mutex
                    while m.waiters() == 0 {
                        sleep(Duration::from_millis(1));
                    }
                }
                c.wait_with(sched).unwrap();
                order.lock().unwrap().push(priority);
                m.unlock_with(sched).unwrap();
            };

            s.spawn(move || wait_once(1));
            while !m.is_locked() {
                sleep(Duration::from_millis(1));
            }
            s.spawn(move || {
                sched.assign(gettid(), 10);
                m.lock_with(sched).unwrap();
                m.unlock_with(sched).unwrap();
            })
            .join()
            .unwrap();
            wait_for_waiters(c, 1);

            s.spawn(move || wait_once(5));
            wait_for_waiters(c, 2);
            for woken in 1..=2 {
                m.lock_with(sched).unwrap();
                c.signal().unwrap();
                m.unlock_with(sched).unwrap();
                while order.lock().unwrap().len() < woken {
                    sleep(Duration::from_millis(1));
                }
            }
        });
        assert_eq!(*order.lock().unwrap(), vec![5, 1]);
    }

    #[test]
    fn cancellation_while_blocked_reacquires_first() {
        let (m, c) = (Arc::new(PiMutex::new()), Arc::new(PiCond::new(&IDLE)));
        static IDLE: PiMutex = PiMutex::new();
        unsafe { c.init(&m, CondFlags::empty()) }.unwrap();
        let held_during_unwind = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        struct Check {
            m: Arc<PiMutex>,
            held: Arc<AtomicBool>,
        }
        impl Drop for Check {
            fn drop(&mut self) {
                self.held.store(self.m.owner() == Some(gettid()), Relaxed);
                let _ = self.m.unlock();
            }
        }

        let waiter = {
            let (m, c, held) = (m.clone(), c.clone(), held_during_unwind.clone());
            thread::spawn(move || {
                m.lock().unwrap();
                let _check = Check { m: m.clone(), held };
                tx.send(cancel::handle()).unwrap();
                c.wait().unwrap();
            })
        };
        let handle = rx.recv().unwrap();
        wait_for_waiters(&c, 1);
        // keep the mutex so the cancelled waiter has to queue on it
        m.lock().unwrap();
        handle.cancel();
        sleep(Duration::from_millis(50));
        assert_eq!(c.waiters(), 0);
        m.unlock().unwrap();

        assert!(cancel::is_cancelled(waiter.join().unwrap_err().as_ref()));
        assert!(held_during_unwind.load(Relaxed));
        assert!(!m.is_locked());
    }

    #[test]
    fn lifecycle() {
        static M: PiMutex = PiMutex::new();
        let c = PiCond::new(&M);
        M.lock().unwrap();
        scope(|s| {
            s.spawn(|| {
                M.lock().unwrap();
                assert_eq!(c.destroy(), Err(Error::Busy));
                assert_eq!(unsafe { c.init(&M, CondFlags::empty()) }, Err(Error::Busy));
                c.signal().unwrap();
                M.unlock().unwrap();
            });
            c.wait().unwrap();
        });
        M.unlock().unwrap();

        c.destroy().unwrap();
        assert_eq!(c.signal(), Err(Error::InvalidArgument));
        assert_eq!(c.broadcast(), Err(Error::InvalidArgument));
        M.lock().unwrap();
        assert_eq!(c.wait(), Err(Error::InvalidArgument));
        M.unlock().unwrap();

        unsafe { c.init(&M, CondFlags::empty()) }.unwrap();
        c.signal().unwrap();
    }

    #[test]
    fn init_validates_the_mutex() {
        let c = PiCond::new(&UNUSED);
        static UNUSED: PiMutex = PiMutex::new();
        let m = PiMutex::new();
        assert_eq!(unsafe { c.init(&m, CondFlags::PSHARED) }, Err(Error::InvalidArgument));
        m.destroy().unwrap();
        assert_eq!(unsafe { c.init(&m, CondFlags::empty()) }, Err(Error::InvalidArgument));
        m.init(MutexFlags::PSHARED).unwrap();
        unsafe { c.init(&m, CondFlags::PSHARED) }.unwrap();
        assert!(c.is_shared());
    }
}
