//! # Deferred cancellation
//!
//! Rust threads can't be killed from outside, so cancellation is cooperative and deferred, the way
//! POSIX deferred cancellation works:
//! - another thread calls [CancelHandle::cancel] on a handle the target gave out
//! - the target acts on it at the next cancellation point: [PiCond::wait](crate::PiCond::wait),
//!   [PiCond::timed_wait](crate::PiCond::timed_wait) or [test_cancel]
//!
//! Acting on it means unwinding the thread with a [Cancelled] payload, so every guard on the stack drops.
//! A condition wait only unwinds once it holds the mutex again, so a [PiMutexGuard](crate::PiMutexGuard)
//! on the stack always finds the mutex owned by its thread.
//!
//! A thread blocked in a condition wait publishes the futex word it sleeps on,
//! so `cancel` can kick it awake.

use std::any::Any;
use std::sync::atomic::{
    AtomicBool, AtomicUsize,
    Ordering::{Relaxed, SeqCst},
};
use std::sync::{atomic::AtomicU32, Arc};

use crate::futex;

/// Unwind payload of a cancelled thread, see [is_cancelled].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[derive(Debug, Default)]
struct CancelState {
    requested: AtomicBool,
    /// address of the futex word the thread sleeps on, low bit set for shared futexes, 0 if not parked
    parked: AtomicUsize,
}

thread_local! {
    static CURRENT: Arc<CancelState> = Arc::new(CancelState::default());
}

/// Lets other threads cancel the thread that created it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

/// The calling thread's handle.
pub fn handle() -> CancelHandle {
    CancelHandle {
        state: CURRENT.with(Arc::clone),
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.state.requested.store(true, SeqCst);
        // pairs with the SeqCst store + load in park(): either the sleeper sees the request
        // before it sleeps, or we see where it sleeps
        let parked = self.state.parked.load(SeqCst);
        if parked != 0 {
            futex::wake_addr(parked & !1, i32::MAX, parked & 1 == 1);
        }
    }

    pub fn is_requested(&self) -> bool {
        self.state.requested.load(SeqCst)
    }
}

/// Is there a cancellation request for the calling thread?
pub fn is_requested() -> bool {
    CURRENT.with(|s| s.requested.load(SeqCst))
}

/// A cancellation point: unwinds with [Cancelled] if a request is pending.
pub fn test_cancel() {
    if CURRENT.with(|s| s.requested.swap(false, SeqCst)) {
        log::debug!("thread {} acts on cancellation", crate::sched::gettid());
        std::panic::resume_unwind(Box::new(Cancelled));
    }
}

/// Tells a joined thread's panic payload apart from a regular panic.
pub fn is_cancelled(payload: &(dyn Any + Send)) -> bool {
    payload.is::<Cancelled>()
}

/// Publishes the word the calling thread is about to sleep on, until dropped.
pub(crate) struct Parked {
    state: Arc<CancelState>,
}

pub(crate) fn park(word: &AtomicU32, shared: bool) -> Parked {
    let state = CURRENT.with(Arc::clone);
    let addr = word as *const AtomicU32 as usize;
    state.parked.store(addr | shared as usize, SeqCst);
    Parked { state }
}

impl Drop for Parked {
    fn drop(&mut self) {
        self.state.parked.store(0, Relaxed);
    }
}
