//! # Priority inheritance mutex and condition variable
//!
//! Blocking on a lock held by a lower priority thread is how real-time programs get unbounded
//! priority inversion: a medium priority thread preempts the holder and the urgent thread waits
//! for both. The primitives here bound it:
//! - [PiMutex] raises its owner to the priority of its most urgent waiter while they wait,
//!   and hands the lock straight to that waiter on unlock
//! - [PiCond] is a condition variable bound to one `PiMutex`, waking waiters in the same
//!   priority order and without spurious wakeups
//!
//! Both are fixed-size, pointer-free `#[repr(C)]` structs on top of futexes, so they work between
//! processes too when placed in shared memory ([shared]).
//!
//! Errors are returned, never raised, see [Error]. Condition waits are cancellation points, see [cancel].
//!
//! ```no_run
//! use pi_sync::{PiCond, PiMutex};
//!
//! static LOCK: PiMutex = PiMutex::new();
//! static READY: PiCond = PiCond::new(&LOCK);
//!
//! LOCK.lock()?;
//! READY.wait()?;
//! LOCK.unlock()?;
//! # Ok::<(), pi_sync::Error>(())
//! ```

pub mod cancel;
pub mod cond;
pub mod error;
mod futex;
pub mod mutex;
mod raw_lock;
pub mod sched;
pub mod shared;
pub mod time;
pub mod wait_queue;

pub use cond::{CondFlags, PiCond};
pub use error::{Error, Result};
pub use mutex::{MutexFlags, PiMutex, PiMutexGuard};
pub use sched::{OsScheduler, Scheduler};
pub use shared::{ProcessShared, SharedMapping};
pub use time::Timespec;
pub use wait_queue::{PriorityTracker, WaitQueue, Waiter, QUEUE_CAPACITY};
