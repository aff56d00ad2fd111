use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::errors::{FfiError, FfiResult};

/// Minimum alignment of any buffer; large enough for every scalar and for
/// libffi return slots.
const MIN_ALIGN: usize = 16;

/// Owned, zero-initialised, aligned byte buffer
pub(crate) struct Storage {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

impl Storage {
    pub fn zeroed(len: usize, align: usize) -> FfiResult<Self> {
        let layout = Layout::from_size_align(len.max(1), align.max(MIN_ALIGN))
            .map_err(|e| FfiError::type_mismatch(format!("invalid layout: {}", e)))?;

        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Ok(Self { ptr, layout, len })
    }

    pub fn from_bytes(bytes: &[u8], align: usize) -> FfiResult<Self> {
        let storage = Self::zeroed(bytes.len(), align)?;
        // SAFETY: freshly allocated with at least bytes.len() bytes
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), storage.as_ptr(), bytes.len());
        }
        Ok(storage)
    }

    /// Copy `len` bytes starting at `src`
    ///
    /// # Safety
    /// `src` must be readable for `len` bytes.
    pub unsafe fn copy_from(src: *const u8, len: usize, align: usize) -> FfiResult<Self> {
        let storage = Self::zeroed(len, align)?;
        if len > 0 {
            std::ptr::copy_nonoverlapping(src, storage.as_ptr(), len);
        }
        Ok(storage)
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: buffer is live and at least len bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// Plain bytes; the engine is driven from one host thread at a time.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}
