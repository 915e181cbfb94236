//! # Wait queue and priority tracker
//!
//! Both primitives keep their blocked threads in a [WaitQueue]: a fixed array of entries stored
//! inline, so the whole queue can live in memory mapped by several processes. Entries are
//! addressed by index, never by pointer.
//!
//! Each entry has a state word that doubles as the futex its thread sleeps on:
//! - FREE - unused
//! - WAITING - a thread is blocked on it
//! - WOKEN - a waker picked it, the thread hasn't collected it yet
//!
//! Leaving WAITING is always a single compare-exchange. A waker (handoff, signal) and the thread
//! itself giving up (timeout, cancellation) race on the same CAS, so exactly one of them wins
//! and the entry is removed exactly once.
//!
//! Ordering is priority descending, then arrival ascending: every enqueue draws a ticket
//! from a per-queue counter.
//!
//! Allocating entries and scanning for the best one happen under the owner's bootstrap lock.
//! The CAS transitions are safe without it.

use std::sync::atomic::{
    AtomicI32, AtomicU32,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::sched::Scheduler;

/// Entries per queue. A `u64` bitmask covers all of them, see [WaitQueue::dequeue_all].
pub const QUEUE_CAPACITY: usize = 64;

pub(crate) const FREE: u32 = 0;
pub(crate) const WAITING: u32 = 1;
pub(crate) const WOKEN: u32 = 2;

#[repr(C)]
struct Entry {
    state: AtomicU32,
    tid: AtomicU32,
    priority: AtomicI32,
    ticket: AtomicU32,
}

impl Entry {
    const fn new() -> Self {
        Self {
            state: AtomicU32::new(FREE),
            tid: AtomicU32::new(0),
            priority: AtomicI32::new(0),
            ticket: AtomicU32::new(0),
        }
    }
}

/// A snapshot of a queued thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub index: u32,
    pub tid: u32,
    pub priority: i32,
    pub ticket: u32,
}

impl Waiter {
    /// true if `self` has to be served before `other`
    fn precedes(&self, other: &Waiter) -> bool {
        // tickets wrap; queued ones are never 2^31 apart
        self.priority > other.priority
            || (self.priority == other.priority
                && (self.ticket.wrapping_sub(other.ticket) as i32) < 0)
    }
}

#[repr(C)]
pub struct WaitQueue {
    next_ticket: AtomicU32,
    entries: [Entry; QUEUE_CAPACITY],
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            entries: [const { Entry::new() }; QUEUE_CAPACITY],
        }
    }

    pub fn reset(&self) {
        self.next_ticket.store(0, Relaxed);
        for e in &self.entries {
            e.state.store(FREE, Relaxed);
        }
    }

    /// Returns the index of the new entry, `None` if every entry is taken.
    pub fn enqueue(&self, tid: u32, priority: i32) -> Option<u32> {
        let (index, entry) = self
            .entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.state.load(Acquire) == FREE)?;
        entry.tid.store(tid, Relaxed);
        entry.priority.store(priority, Relaxed);
        entry
            .ticket
            .store(self.next_ticket.fetch_add(1, Relaxed), Relaxed);
        // publishes the fields above to whoever sees WAITING
        entry.state.store(WAITING, Release);
        Some(index as u32)
    }

    /// The waiter that would be served next, left in the queue.
    pub fn peek_highest(&self) -> Option<Waiter> {
        self.waiting().reduce(|best, w| if w.precedes(&best) { w } else { best })
    }

    /// Removes the highest priority, earliest arrived waiter and marks it woken.
    /// The caller still has to wake its futex word.
    pub fn dequeue_highest(&self) -> Option<Waiter> {
        loop {
            let best = self.peek_highest()?;
            if self.wake(best.index) {
                return Some(best);
            }
            // lost to a timeout or cancellation of that waiter, look again
        }
    }

    /// Marks every current waiter woken. Bit `i` of the result is set if entry `i` was woken.
    pub fn dequeue_all(&self) -> u64 {
        let mut mask = 0u64;
        for (i, e) in self.entries.iter().enumerate() {
            if e
                .state
                .compare_exchange(WAITING, WOKEN, AcqRel, Relaxed)
                .is_ok()
            {
                mask |= 1 << i;
            }
        }
        mask
    }

    /// WAITING -> WOKEN for one particular entry.
    pub fn wake(&self, index: u32) -> bool {
        self.entries[index as usize]
            .state
            .compare_exchange(WAITING, WOKEN, AcqRel, Relaxed)
            .is_ok()
    }

    /// Takes a waiting entry out of the queue (timeout, cancellation).
    ///
    /// Returns `false` and changes nothing if the entry isn't waiting anymore:
    /// a waker got there first, or it was already removed.
    pub fn remove(&self, index: u32) -> bool {
        self.entries[index as usize]
            .state
            .compare_exchange(WAITING, FREE, AcqRel, Relaxed)
            .is_ok()
    }

    /// The woken thread hands its entry back.
    pub fn release(&self, index: u32) {
        let released = self.entries[index as usize]
            .state
            .compare_exchange(WOKEN, FREE, Release, Relaxed)
            .is_ok();
        debug_assert!(released, "entry {index} released without being woken");
    }

    /// The queued thread takes its entry back, whoever got to it first.
    ///
    /// Returns `true` if it was still waiting, `false` if a waker had claimed it.
    /// The entry is free afterwards either way.
    pub fn withdraw(&self, index: u32) -> bool {
        if self.remove(index) {
            true
        } else {
            self.release(index);
            false
        }
    }

    pub fn is_waiting(&self, index: u32) -> bool {
        self.entries[index as usize].state.load(Acquire) == WAITING
    }

    pub(crate) fn state_word(&self, index: u32) -> &AtomicU32 {
        &self.entries[index as usize].state
    }

    /// Number of waiting (not yet woken) entries.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state.load(Acquire) == WAITING)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries are neither free nor waiting once woken, but still occupied.
    pub fn is_idle(&self) -> bool {
        self.entries.iter().all(|e| e.state.load(Acquire) == FREE)
    }

    /// max(base, priority of every waiter)
    pub fn recompute_priority(&self, base: i32) -> i32 {
        self.waiting().map(|w| w.priority).fold(base, i32::max)
    }

    fn waiting(&self) -> impl Iterator<Item = Waiter> + '_ {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            (e.state.load(Acquire) == WAITING).then(|| Waiter {
                index: i as u32,
                tid: e.tid.load(Relaxed),
                priority: e.priority.load(Relaxed),
                ticket: e.ticket.load(Relaxed),
            })
        })
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

const UNKNOWN: i32 = i32::MIN;

/// A thread of this process running boosted because of private mutexes it owns.
#[derive(Debug)]
struct Boosted {
    tid: u32,
    /// its own priority, read before the first boost
    base: i32,
    /// what it was last set to
    applied: i32,
    /// (mutex, highest priority queued on it), one per contended mutex it owns
    demands: Vec<(usize, i32)>,
}

impl Boosted {
    /// max(base, demands), leaving out the mutex keyed `skip`
    fn effective_without(&self, skip: Option<usize>) -> i32 {
        self.demands
            .iter()
            .filter(|(k, _)| Some(*k) != skip)
            .map(|(_, p)| *p)
            .fold(self.base, i32::max)
    }

    fn apply<S: Scheduler + ?Sized>(&mut self, sched: &S) {
        let effective = self.effective_without(None);
        if effective != self.applied {
            log::trace!("thread {} runs at {effective} (base {})", self.tid, self.base);
            sched.set_priority(self.tid, effective);
            self.applied = effective;
        }
    }
}

/// Every boosted thread of the process. Kept small: entries go away with the last demand.
static BOOSTED: Mutex<Vec<Boosted>> = Mutex::new(Vec::new());

fn boosted() -> MutexGuard<'static, Vec<Boosted>> {
    BOOSTED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks the priority a lock owner runs at because of the lock.
///
/// For process-private mutexes the owner's base priority is recorded once per thread, when it
/// gets its first boost, and its effective priority is the max over that base and the waiters of
/// every private mutex it owns. Releasing one mutex therefore keeps the boosts of the others.
///
/// A shared mutex may be owned by a thread of another process, so it keeps a snapshot in place:
/// `base` is the owner's priority apart from this mutex, `applied` the boost in effect
/// (UNKNOWN if none).
///
/// This is the only place calling [Scheduler::set_priority].
#[repr(C)]
pub struct PriorityTracker {
    base: AtomicI32,
    applied: AtomicI32,
}

impl PriorityTracker {
    pub const fn new() -> Self {
        Self {
            base: AtomicI32::new(UNKNOWN),
            applied: AtomicI32::new(UNKNOWN),
        }
    }

    /// Forgets the owner: its base gets resolved lazily, on the first contention.
    pub fn reset(&self) {
        self.base.store(UNKNOWN, Relaxed);
        self.applied.store(UNKNOWN, Relaxed);
    }

    /// Highest waiter priority this mutex currently imposes on its owner, if any.
    pub fn boost(&self) -> Option<i32> {
        match self.applied.load(Relaxed) {
            UNKNOWN => None,
            p => Some(p),
        }
    }

    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Recomputes the owner's effective priority after `queue` changed and applies it if it moved.
    pub fn refresh<S: Scheduler + ?Sized>(&self, sched: &S, owner: u32, queue: &WaitQueue, shared: bool) {
        if shared {
            return self.refresh_in_place(sched, owner, queue);
        }
        let demand = queue.peek_highest().map(|w| w.priority);
        let key = self.key();
        let mut all = boosted();
        let at = match (all.iter().position(|b| b.tid == owner), demand) {
            (Some(at), _) => at,
            (None, None) => return,
            (None, Some(_)) => {
                let base = sched.priority_of(owner);
                all.push(Boosted {
                    tid: owner,
                    base,
                    applied: base,
                    demands: Vec::new(),
                });
                all.len() - 1
            }
        };
        let entry = &mut all[at];
        entry.demands.retain(|(k, _)| *k != key);
        if let Some(p) = demand {
            entry.demands.push((key, p));
        }
        entry.apply(sched);
        let raised = demand.filter(|p| *p > entry.base);
        if entry.demands.is_empty() {
            all.swap_remove(at);
        }
        self.applied.store(raised.unwrap_or(UNKNOWN), Relaxed);
    }

    fn refresh_in_place<S: Scheduler + ?Sized>(&self, sched: &S, owner: u32, queue: &WaitQueue) {
        let mut base = self.base.load(Relaxed);
        if base == UNKNOWN {
            base = Self::priority_apart_from(sched, owner, None);
            self.base.store(base, Relaxed);
        }
        let current = self.boost().unwrap_or(base);
        let effective = queue.recompute_priority(base);
        if effective != current {
            log::trace!("thread {owner} runs at {effective} (base {base})");
            sched.set_priority(owner, effective);
            let applied = if effective == base { UNKNOWN } else { effective };
            self.applied.store(applied, Relaxed);
        }
    }

    /// The owner gives the lock up: drop the boost coming from this mutex, keep the others.
    pub fn restore<S: Scheduler + ?Sized>(&self, sched: &S, owner: u32, shared: bool) {
        if shared {
            if self.boost().is_some() {
                let base = boosted()
                    .iter()
                    .find(|b| b.tid == owner)
                    .map_or(self.base.load(Relaxed), |b| b.effective_without(None));
                sched.set_priority(owner, base);
            }
        } else {
            let key = self.key();
            let mut all = boosted();
            if let Some(at) = all.iter().position(|b| b.tid == owner) {
                let entry = &mut all[at];
                entry.demands.retain(|(k, _)| *k != key);
                entry.apply(sched);
                if entry.demands.is_empty() {
                    all.swap_remove(at);
                }
            }
        }
        self.reset();
    }

    /// The priority `tid` will run at once this mutex stops boosting it.
    pub fn settled_priority<S: Scheduler + ?Sized>(&self, sched: &S, tid: u32, shared: bool) -> i32 {
        if shared {
            match self.boost() {
                Some(_) => self.base.load(Relaxed),
                None => sched.priority_of(tid),
            }
        } else {
            Self::priority_apart_from(sched, tid, Some(self.key()))
        }
    }

    /// `tid`'s base raised by the private mutexes it owns, except the one keyed `skip`.
    fn priority_apart_from<S: Scheduler + ?Sized>(sched: &S, tid: u32, skip: Option<usize>) -> i32 {
        match boosted().iter().find(|b| b.tid == tid) {
            Some(b) => b.effective_without(skip),
            None => sched.priority_of(tid),
        }
    }
}

impl Default for PriorityTracker {
    fn default() -> Self {
        Self::new()
    }
}
