//! # Priority inheritance mutex
//!
//! The lock word is the owner's tid (0 when unlocked), so the uncontended lock is a single CAS.
//!
//! Contention goes through the [WaitQueue]:
//! - the locker queues itself with its priority, and the owner's effective priority is raised to
//!   the highest queued priority ([PriorityTracker]); then it sleeps on its own queue entry
//! - the unlocker picks the highest priority, earliest arrived waiter, writes *its* tid into the
//!   lock word and only then wakes it. The woken thread already owns the mutex.
//!
//! That direct handoff is what bounds priority inversion to a single critical section: a released
//! mutex is never up for grabs while somebody waits, so neither the releasing thread nor a newcomer
//! can barge in front of a high priority waiter.
//!
//! All state is atomics in a `#[repr(C)]` struct without pointers. With [MutexFlags::PSHARED]
//! it may live in memory shared between processes, see [crate::shared].

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{
    AtomicU32,
    Ordering::{Acquire, Relaxed, Release},
};

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::futex;
use crate::raw_lock::RawLock;
use crate::sched::{OsScheduler, Scheduler};
use crate::shared::ProcessShared;
use crate::wait_queue::{PriorityTracker, WaitQueue, WAITING};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MutexFlags: u32 {
        /// may be placed in memory shared between processes
        const PSHARED = 1;
    }
}

/// "pimx"; anything else in the magic word means uninitialized or destroyed
const MUTEX_MAGIC: u32 = 0x7069_6d78;

#[repr(C)]
pub struct PiMutex {
    magic: AtomicU32,
    flags: AtomicU32,
    /// tid of the owner, 0 if unlocked
    owner: AtomicU32,
    guard: RawLock,
    /// lockers waiting for a free queue entry
    parked: AtomicU32,
    /// bumped whenever a queue entry frees up while somebody is parked
    vacancy: AtomicU32,
    tracker: PriorityTracker,
    queue: WaitQueue,
}

// SAFETY: atomics and arrays of atomics only; all zeroes reads as "uninitialized"
unsafe impl ProcessShared for PiMutex {}

impl PiMutex {
    /// A ready, unlocked, process-private mutex. Usable in a `static`.
    pub const fn new() -> Self {
        Self::with_flags(MutexFlags::empty())
    }

    pub const fn with_flags(flags: MutexFlags) -> Self {
        Self {
            magic: AtomicU32::new(MUTEX_MAGIC),
            flags: AtomicU32::new(flags.bits()),
            owner: AtomicU32::new(0),
            guard: RawLock::new(),
            parked: AtomicU32::new(0),
            vacancy: AtomicU32::new(0),
            tracker: PriorityTracker::new(),
            queue: WaitQueue::new(),
        }
    }

    /// (Re)initializes the mutex in place, e.g. in freshly mapped shared memory.
    ///
    /// Fails with [Error::InvalidArgument] if it's an initialized mutex somebody holds.
    pub fn init(&self, flags: MutexFlags) -> Result<()> {
        if self.magic.load(Acquire) == MUTEX_MAGIC && self.owner.load(Acquire) != 0 {
            return Err(Error::InvalidArgument);
        }
        self.flags.store(flags.bits(), Relaxed);
        self.owner.store(0, Relaxed);
        self.guard.reset();
        self.parked.store(0, Relaxed);
        self.vacancy.store(0, Relaxed);
        self.tracker.reset();
        self.queue.reset();
        self.magic.store(MUTEX_MAGIC, Release);
        Ok(())
    }

    pub fn lock(&self) -> Result<()> {
        self.lock_with(&OsScheduler)
    }

    pub fn lock_with<S: Scheduler + ?Sized>(&self, sched: &S) -> Result<()> {
        self.check()?;
        let me = sched.current_tid();
        match self.owner.compare_exchange(0, me, Acquire, Relaxed) {
            Ok(_) => Ok(()),
            Err(owner) if owner == me => Err(Error::Deadlock),
            Err(_) => self.lock_contended(sched, me),
        }
    }

    #[cold]
    fn lock_contended<S: Scheduler + ?Sized>(&self, sched: &S, me: u32) -> Result<()> {
        let shared = self.is_shared();
        let priority = sched.current_priority();

        let index = loop {
            let guard = self.guard.lock(shared);
            self.check()?;
            let owner = match self.owner.compare_exchange(0, me, Acquire, Relaxed) {
                // released while we went for the guard
                Ok(_) => return Ok(()),
                Err(owner) => owner,
            };
            if let Some(index) = self.queue.enqueue(me, priority) {
                self.tracker.refresh(sched, owner, &self.queue, shared);
                break index;
            }
            // every entry is taken: sleep until a handed-off waiter gives one back
            let seen = self.vacancy.load(Acquire);
            self.parked.fetch_add(1, Relaxed);
            drop(guard);
            futex::wait(&self.vacancy, seen, None, shared);
            self.parked.fetch_sub(1, Relaxed);
        };

        log::trace!("thread {me} queued on mutex {:p} at priority {priority}", self);
        let word = self.queue.state_word(index);
        while word.load(Acquire) == WAITING {
            futex::wait(word, WAITING, None, shared);
        }

        // the unlocker made us the owner before waking us
        let _guard = self.guard.lock(shared);
        self.queue.release(index);
        if self.parked.load(Relaxed) > 0 {
            self.vacancy.fetch_add(1, Release);
            futex::wake(&self.vacancy, i32::MAX, shared);
        }
        Ok(())
    }

    pub fn try_lock(&self) -> Result<()> {
        self.try_lock_with(&OsScheduler)
    }

    pub fn try_lock_with<S: Scheduler + ?Sized>(&self, sched: &S) -> Result<()> {
        self.check()?;
        self.owner
            .compare_exchange(0, sched.current_tid(), Acquire, Relaxed)
            .map(|_| ())
            .map_err(|_| Error::Busy)
    }

    pub fn unlock(&self) -> Result<()> {
        self.unlock_with(&OsScheduler)
    }

    /// Hands the mutex to the best waiter, or unlocks it if nobody waits.
    pub fn unlock_with<S: Scheduler + ?Sized>(&self, sched: &S) -> Result<()> {
        self.check()?;
        let me = sched.current_tid();
        let shared = self.is_shared();

        let guard = self.guard.lock(shared);
        if self.owner.load(Relaxed) != me {
            return Err(Error::NotOwner);
        }
        self.tracker.restore(sched, me, shared);

        let Some(next) = self.queue.peek_highest() else {
            self.owner.store(0, Release);
            return Ok(());
        };
        // mutex waiters never leave the queue on their own, so the entry is still waiting
        self.owner.store(next.tid, Release);
        self.queue.wake(next.index);
        self.tracker.refresh(sched, next.tid, &self.queue, shared);
        drop(guard);

        log::trace!("mutex {:p} handed from {me} to {}", self, next.tid);
        futex::wake(self.queue.state_word(next.index), 1, shared);
        Ok(())
    }

    /// Fails with [Error::Busy] while the mutex is held or waited for.
    pub fn destroy(&self) -> Result<()> {
        self.check()?;
        let _guard = self.guard.lock(self.is_shared());
        if self.owner.load(Relaxed) != 0 || !self.queue.is_idle() || self.parked.load(Relaxed) > 0
        {
            return Err(Error::Busy);
        }
        self.magic.store(0, Release);
        Ok(())
    }

    /// Locks and returns a guard unlocking on drop, also when the thread unwinds after cancellation.
    pub fn lock_guard(&self) -> Result<PiMutexGuard<'_>> {
        self.lock()?;
        Ok(PiMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Relaxed) != 0
    }

    pub fn owner(&self) -> Option<u32> {
        match self.owner.load(Acquire) {
            0 => None,
            tid => Some(tid),
        }
    }

    /// Threads currently blocked in `lock`.
    pub fn waiters(&self) -> usize {
        self.queue.len()
    }

    pub fn is_shared(&self) -> bool {
        MutexFlags::from_bits_truncate(self.flags.load(Relaxed)).contains(MutexFlags::PSHARED)
    }

    /// The priority the owner `tid` drops to once it releases this mutex.
    pub(crate) fn settled_priority<S: Scheduler + ?Sized>(&self, sched: &S, tid: u32) -> i32 {
        let shared = self.is_shared();
        let _guard = self.guard.lock(shared);
        self.tracker.settled_priority(sched, tid, shared)
    }

    pub(crate) fn is_owned_by(&self, tid: u32) -> bool {
        self.owner.load(Acquire) == tid
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.magic.load(Acquire) == MUTEX_MAGIC {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }
}

impl Default for PiMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PiMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PiMutex")
            .field("initialized", &self.check().is_ok())
            .field("owner", &self.owner())
            .field("waiters", &self.waiters())
            .field("shared", &self.is_shared())
            .finish()
    }
}

/// Unlocks the mutex when dropped.
///
/// Only the locking thread may unlock, so the guard stays on it:
///
/// ```compile_fail
/// fn send<T: Send>(_: T) {}
/// let m = pi_sync::PiMutex::new();
/// send(m.lock_guard().unwrap());
/// ```
pub struct PiMutexGuard<'a> {
    mutex: &'a PiMutex,
    _not_send: PhantomData<*const ()>,
}

impl PiMutexGuard<'_> {
    pub fn mutex(&self) -> &PiMutex {
        self.mutex
    }
}

impl Drop for PiMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            log::warn!("guard of mutex {:p} failed to unlock: {e}", self.mutex);
        }
    }
}
