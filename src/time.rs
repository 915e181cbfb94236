//! # Deadlines
//!
//! Timed waits take an absolute point on CLOCK_MONOTONIC rather than a relative timeout.
//! A loop of timed waits against one deadline doesn't accumulate drift that way,
//! and the kernel's `FUTEX_WAIT_BITSET` accepts absolute monotonic timestamps as-is.

use std::ops::Add;
use std::time::Duration;

pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// An absolute CLOCK_MONOTONIC timestamp.
///
/// Field order matters: the derived ordering compares `sec` first,
/// which is only meaningful for valid (normalized) values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts is a valid out-pointer; CLOCK_MONOTONIC is always available on Linux
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        Self {
            sec: ts.tv_sec as i64,
            nsec: ts.tv_nsec as i64,
        }
    }

    /// now + `timeout`
    pub fn after(timeout: Duration) -> Self {
        Self::now() + timeout
    }

    /// The sub-second part has to lie within [0, 999_999_999].
    pub fn is_valid(&self) -> bool {
        (0..NSEC_PER_SEC).contains(&self.nsec)
    }

    pub fn has_passed(&self) -> bool {
        *self <= Self::now()
    }

    pub(crate) fn to_libc(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.sec as libc::time_t,
            tv_nsec: self.nsec as libc::c_long,
        }
    }
}

impl Add<Duration> for Timespec {
    type Output = Timespec;

    fn add(self, rhs: Duration) -> Self::Output {
        let mut sec = self.sec.saturating_add(rhs.as_secs() as i64);
        let mut nsec = self.nsec + rhs.subsec_nanos() as i64;
        if nsec >= NSEC_PER_SEC {
            nsec -= NSEC_PER_SEC;
            sec = sec.saturating_add(1);
        }
        Timespec { sec, nsec }
    }
}
