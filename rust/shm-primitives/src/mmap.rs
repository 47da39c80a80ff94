//! Shared mappings of fd-backed memory objects.
//!
//! This module provides `MmapRegion`, a `MAP_SHARED` read/write mapping of a
//! file descriptor. Writes through one mapping are visible through every other
//! mapping of the same object, in this process or another one.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::NonNull;

use crate::Region;

/// A read/write `MAP_SHARED` mapping. Unmapped on drop.
pub struct MmapRegion {
    /// Pointer to the mapped memory
    ptr: NonNull<u8>,
    /// Length of the mapping in bytes
    len: usize,
}

impl MmapRegion {
    /// Map the first `len` bytes of `fd`.
    ///
    /// The mapping does not keep `fd` open; the caller may close it afterwards.
    /// The caller is responsible for checking that the object is at least
    /// `len` bytes long (touching pages past the end raises `SIGBUS`).
    pub fn map(fd: BorrowedFd<'_>, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping length must be > 0",
            ));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;

        Ok(Self { ptr, len })
    }

    /// Get a `Region` view of this mmap.
    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: the mapping is valid for the lifetime of MmapRegion.
        unsafe { Region::from_non_null(self.ptr, self.len) }
    }

    /// Get the size of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is empty (zero bytes).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes `[offset, offset + len)` of the mapping, if in bounds.
    ///
    /// The other side of the mapping may be writing concurrently; callers
    /// treat the contents as untrusted input.
    pub fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let sub = self.region().subregion(offset, len)?;
        // SAFETY: the sub-region is in bounds and the mapping lives as long as &self.
        Some(unsafe { std::slice::from_raw_parts(sub.as_ptr(), sub.len()) })
    }

    /// The whole mapping as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: &mut self guarantees no other slice from this mapping is live.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// The whole mapping as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: in bounds and tied to &self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if rc != 0 {
            tracing::error!(
                error = %io::Error::last_os_error(),
                len = self.len,
                "munmap failed for shared mapping"
            );
        }
    }
}

impl std::fmt::Debug for MmapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

// SAFETY: The mapping is valid for the lifetime of MmapRegion and can be
// accessed from multiple threads (the underlying memory is shared).
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}
