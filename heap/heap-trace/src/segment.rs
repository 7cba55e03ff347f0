//! The segment provider: page-aligned zeroed backing storage for one heap.

use core::alloc::LayoutError;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

const PAGE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("segment length must be non-zero")]
    Empty,
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

/// A zero-initialized, page-aligned byte region owned by the harness and
/// lent to the allocator for its whole lifetime.
pub struct SegmentBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl SegmentBuffer {
    /// Reserve `len` bytes.
    ///
    /// # Errors
    /// [`SegmentError`] when `len` is zero or overflows a layout.
    pub fn new(len: usize) -> Result<Self, SegmentError> {
        if len == 0 {
            return Err(SegmentError::Empty);
        }
        let layout = Layout::from_size_align(len, PAGE)?;
        // SAFETY: the layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Ok(Self { ptr, layout })
    }

    #[must_use]
    pub const fn start(&self) -> NonNull<u8> {
        self.ptr
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.layout.size()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for SegmentBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_and_page_aligned() {
        let segment = SegmentBuffer::new(8192).unwrap();
        assert_eq!(segment.len(), 8192);
        assert_eq!(segment.start().as_ptr() as usize % PAGE, 0);
        let bytes = unsafe { std::slice::from_raw_parts(segment.start().as_ptr(), 8192) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_length_is_rejected() {
        assert!(SegmentBuffer::new(0).is_err());
    }
}
