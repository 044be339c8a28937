//! Allocator association for completion handlers.
//!
//! A handler decides where its own type-erased storage lives. Most handlers use
//! [`Global`]; pooled or arena-backed callers provide their own
//! [`HandlerAllocator`].

use crate::error::HandlerError;

use std::alloc::Layout;
use std::ptr::NonNull;

/// Source of storage for a type-erased completion handler.
///
/// Requests are never zero-sized; zero-sized handlers skip allocation entirely.
pub trait HandlerAllocator: Clone + Send + 'static {
    /// Allocates a block fitting `layout`.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, HandlerError>;

    /// Returns a block previously obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on an equivalent allocator with the same `layout`,
    /// and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The process-wide heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct Global;

impl HandlerAllocator for Global {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, HandlerError> {
        debug_assert!(layout.size() != 0);

        // SAFETY: layout is non-zero-sized.
        let ptr = unsafe { std::alloc::alloc(layout) };

        NonNull::new(ptr).ok_or(HandlerError::Allocation {
            size: layout.size(),
            align: layout.align(),
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: upheld by the caller.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}
