//! Native allocation primitives.
//!
//! The runtime only reaches these through a [`DirectReleaser`](crate::releaser::DirectReleaser),
//! never by freeing raw addresses itself.

use std::alloc::{self, Layout};

/// Alignment of every runtime-allocated block, matching `max_align_t`.
pub const NATIVE_ALIGN: usize = 16;

pub trait NativeAllocator: Send + Sync + 'static {
    /// Allocate a zeroed block. Returns 0 when no memory is available.
    fn allocate(&self, layout: Layout) -> usize;

    /// Return a block obtained from [`NativeAllocator::allocate`].
    ///
    /// # Safety
    /// `address` must come from `allocate` on this allocator with the same
    /// `layout`, and must not be released twice.
    unsafe fn release(&self, address: usize, layout: Layout);

    /// Hint that freed memory may be handed back to the operating system.
    fn trim(&self) {}
}

/// Allocator backed by the Rust global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl NativeAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> usize {
        if layout.size() == 0 {
            return 0;
        }
        // SAFETY: layout has a non-zero size.
        unsafe { alloc::alloc_zeroed(layout) as usize }
    }

    unsafe fn release(&self, address: usize, layout: Layout) {
        if address != 0 {
            // SAFETY: upheld by the caller; address came from alloc_zeroed with this layout.
            unsafe { alloc::dealloc(address as *mut u8, layout) }
        }
    }

    fn trim(&self) {
        #[cfg(all(target_os = "linux", target_env = "gnu"))]
        {
            // SAFETY: malloc_trim has no preconditions.
            unsafe {
                libc::malloc_trim(0);
            }
        }
    }
}

/// Layout for `bytes` bytes at the runtime's native alignment.
pub(crate) fn native_layout(bytes: usize) -> Option<Layout> {
    Layout::from_size_align(bytes, NATIVE_ALIGN).ok()
}
