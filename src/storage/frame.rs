// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Page-aligned frame allocations.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

use super::PAGE_SIZE;

/// A contiguous, zero-initialized allocation of page frames, aligned to
/// [`PAGE_SIZE`] as direct I/O requires.
///
/// The buffer never reallocates, so raw pointers into it (e.g. the targets
/// of swizzled swips) stay valid for its whole lifetime even when the owner
/// moves.
pub struct FrameBuffer {
    ptr: NonNull<u8>,
    num_pages: usize,
}

impl FrameBuffer {
    pub fn zeroed(num_pages: usize) -> Self {
        assert!(num_pages > 0);
        let layout = Self::layout(num_pages);
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        FrameBuffer { ptr, num_pages }
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// All frames as one byte slice.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.num_pages * PAGE_SIZE) }
    }

    /// The frames `[first, first + count)` as one byte slice.
    pub fn page_range_mut(&mut self, first: usize, count: usize) -> &mut [u8] {
        assert!(first + count <= self.num_pages);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ptr.as_ptr().add(first * PAGE_SIZE),
                count * PAGE_SIZE,
            )
        }
    }

    pub fn page_bytes(&self, index: usize) -> &[u8] {
        assert!(index < self.num_pages);
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(index * PAGE_SIZE), PAGE_SIZE) }
    }

    pub fn page_bytes_mut(&mut self, index: usize) -> &mut [u8] {
        assert!(index < self.num_pages);
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(index * PAGE_SIZE), PAGE_SIZE)
        }
    }

    fn layout(num_pages: usize) -> Layout {
        Layout::from_size_align(num_pages * PAGE_SIZE, PAGE_SIZE)
            .expect("frame buffer layout overflow")
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), Self::layout(self.num_pages)) };
    }
}

// The buffer exclusively owns its allocation; sharing follows the usual
// borrow rules of the accessors.
unsafe impl Send for FrameBuffer {}
unsafe impl Sync for FrameBuffer {}
