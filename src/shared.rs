//! # Process-shared placement
//!
//! A shared instance is just bytes in a `MAP_SHARED` mapping that several processes see,
//! possibly at different virtual addresses. The types allowed there implement [ProcessShared]:
//! - `#[repr(C)]`, built from atomics and fixed-size arrays only
//! - all zeroes is a valid value (for the primitives: "uninitialized", every operation fails with
//!   [Error::InvalidArgument](crate::Error::InvalidArgument) until `init`)
//! - no process-local addresses once initialized as shared
//!
//! [SharedMapping] owns an anonymous shared mapping, which `fork` children inherit, and hands out
//! typed references into it.

use std::io;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64};

use crate::error::{Error, Result};

/// # Safety
///
/// Implementors must be valid when all-zero and must not store process-local addresses
/// while used as shared instances.
pub unsafe trait ProcessShared: Sized {}

unsafe impl ProcessShared for AtomicBool {}
unsafe impl ProcessShared for AtomicU32 {}
unsafe impl ProcessShared for AtomicI32 {}
unsafe impl ProcessShared for AtomicU64 {}
unsafe impl ProcessShared for AtomicI64 {}

/// Rounds `offset` up to a multiple of `align` (a power of two).
pub const fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// Offset right after a `T` placed at the first suitable position from `offset`.
pub const fn end_of<T>(offset: usize) -> usize {
    align_up(offset, align_of::<T>()) + size_of::<T>()
}

pub struct SharedMapping {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory; everything placed in it is ProcessShared, i.e. atomics
unsafe impl Send for SharedMapping {}
unsafe impl Sync for SharedMapping {}

impl SharedMapping {
    /// Maps `len` zeroed bytes, shared with every child forked afterwards.
    pub fn new(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        // SAFETY: anonymous mapping, no fd or address hint involved
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(addr as *mut u8).ok_or_else(io::Error::last_os_error)?;
        Ok(Self { base, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// A `T` living at `offset` bytes into the mapping.
    ///
    /// Fails with [Error::InvalidArgument] if it's misaligned or doesn't fit.
    pub fn place<T: ProcessShared>(&self, offset: usize) -> Result<&T> {
        let end = offset.checked_add(size_of::<T>()).ok_or(Error::InvalidArgument)?;
        if end > self.len || offset % align_of::<T>() != 0 {
            return Err(Error::InvalidArgument);
        }
        // SAFETY: in bounds and aligned; the bytes are a valid T whatever they hold,
        // as the mapping starts zeroed and only ever gets written through ProcessShared types
        Ok(unsafe { &*(self.base.as_ptr().add(offset) as *const T) })
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        // SAFETY: unmaps exactly what new() mapped; references from place() borrow self
        unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) };
    }
}
