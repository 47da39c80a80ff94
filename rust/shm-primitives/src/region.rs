use std::ptr::NonNull;

/// A contiguous region of memory addressed by offset.
///
/// # Safety
///
/// The caller must ensure:
/// - `base` is valid for `len` bytes
/// - the memory remains valid for the lifetime of this Region
#[derive(Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Create a region from a raw pointer and length.
    ///
    /// Returns `None` for a null `base`.
    ///
    /// # Safety
    ///
    /// - `base` must be valid for `len` bytes
    /// - the memory must remain valid for the lifetime of this Region
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Option<Self> {
        let base = NonNull::new(base)?;
        Some(Self { base, len })
    }

    /// # Safety
    ///
    /// Same contract as [`Region::from_raw`].
    pub(crate) unsafe fn from_non_null(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// Returns the base pointer of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region has zero length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the sub-region `[offset, offset + len)`, or `None` if any part
    /// of it falls outside this region (including arithmetic overflow).
    pub fn subregion(&self, offset: usize, len: usize) -> Option<Region> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: offset <= self.len, so the pointer stays within (or one past) the region.
        let base = unsafe { self.as_ptr().add(offset) };
        Some(Region {
            base: NonNull::new(base)?,
            len,
        })
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}
