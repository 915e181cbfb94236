//! # Bootstrap lock
//!
//! The wait queues of [PiMutex](crate::PiMutex) and [PiCond](crate::PiCond) need mutual exclusion of their own,
//! and it can't come from `PiMutex` itself. This is a plain futex lock on a single word:
//! - 0 - unlocked
//! - 1 - locked, no other threads
//! - 2 - locked, other threads are waiting
//!
//! Critical sections under it are a scan of a fixed-size array, so a short spin usually wins
//! before falling back to the futex. The unlock skips the wake syscall unless somebody marked the word with 2.

use std::sync::atomic::{
    AtomicU32,
    Ordering::{Acquire, Relaxed, Release},
};

use crate::futex;

#[repr(C)]
pub(crate) struct RawLock {
    state: AtomicU32,
}

impl RawLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Only valid while nobody can be holding or waiting for the lock (init).
    pub fn reset(&self) {
        self.state.store(0, Relaxed);
    }

    pub fn lock(&self, shared: bool) -> RawGuard<'_> {
        if self.state.compare_exchange(0, 1, Acquire, Relaxed).is_err() {
            self.lock_contended(shared);
        }
        RawGuard { lock: self, shared }
    }

    #[cold]
    fn lock_contended(&self, shared: bool) {
        let mut spin_count = 0;

        // only spin on 1, a 2 means others already gave up and sleep
        while self.state.load(Relaxed) == 1 && spin_count < 100 {
            spin_count += 1;
            std::hint::spin_loop();
        }

        if self.state.compare_exchange(0, 1, Acquire, Relaxed).is_ok() {
            return;
        }

        // leaves 2 behind so the holder knows it has to wake someone
        while self.state.swap(2, Acquire) != 0 {
            futex::wait(&self.state, 2, None, shared);
        }
    }
}

pub(crate) struct RawGuard<'a> {
    lock: &'a RawLock,
    shared: bool,
}

impl Drop for RawGuard<'_> {
    fn drop(&mut self) {
        if self.lock.state.swap(0, Release) == 2 {
            futex::wake(&self.lock.state, 1, self.shared);
        }
    }
}
