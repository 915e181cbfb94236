//! # Futex
//!
//! The blocking primitive under everything: sleep on a 32-bit word while it holds an expected value,
//! wake sleepers of a word.
//!
//! Private futexes are keyed by (address space, virtual address), shared ones by the backing page.
//! That's why the private flag is only set for non-shared instances: a waker in another process
//! has to compute the same key as the sleeper.

use std::ptr;
use std::sync::atomic::AtomicU32;

use crate::time::Timespec;

const FUTEX_WAKE: i32 = 1;
const FUTEX_WAIT_BITSET: i32 = 9;
const FUTEX_PRIVATE_FLAG: i32 = 128;
const FUTEX_BITSET_MATCH_ANY: u32 = 0xFFFF_FFFF;

fn op(base: i32, shared: bool) -> i32 {
    if shared {
        base
    } else {
        base | FUTEX_PRIVATE_FLAG
    }
}

/// Sleeps while `word == expected`, at most until the absolute monotonic `deadline`.
///
/// Returns `false` only if the deadline passed. Any other return (wake, value mismatch, signal)
/// is reported as `true` and callers re-check their condition.
pub(crate) fn wait(word: &AtomicU32, expected: u32, deadline: Option<&Timespec>, shared: bool) -> bool {
    let ts = deadline.map(|d| d.to_libc());
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);
    // SAFETY: word is a live aligned u32; ts_ptr is null or points to ts on this frame.
    // FUTEX_WAIT_BITSET without FUTEX_CLOCK_REALTIME measures the deadline on CLOCK_MONOTONIC.
    let r = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32,
            op(FUTEX_WAIT_BITSET, shared),
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            FUTEX_BITSET_MATCH_ANY,
        )
    };
    !(r < 0 && last_errno() == libc::ETIMEDOUT)
}

/// Wakes up to `count` threads sleeping on `word`.
pub(crate) fn wake(word: &AtomicU32, count: i32, shared: bool) {
    wake_addr(word as *const AtomicU32 as usize, count, shared);
}

/// Same as [wake], by address.
///
/// The kernel never dereferences the address in userspace terms, so a stale address
/// at worst wakes nobody (EFAULT) or causes a spurious wakeup that sleepers tolerate.
pub(crate) fn wake_addr(addr: usize, count: i32, shared: bool) {
    // SAFETY: FUTEX_WAKE only hashes the address, it doesn't access memory we don't own
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const u32,
            op(FUTEX_WAKE, shared),
            count,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        );
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
