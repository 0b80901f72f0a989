//! The platform allocator underneath both allocators.
//!
//! Neither allocator manages memory itself. Each block, header and trailer
//! included, is requested from a [`Platform`] and handed back to it on free.
//! This keeps the allocators usable on top of any backing store, and lets
//! tests observe which path (plain or aligned) a block took.
//!
//! With the `nightly` feature, any type that implements
//! [`core::alloc::Allocator`] is a platform. Otherwise, [`System`] is.

use core::ptr::NonNull;

#[cfg(not(feature = "nightly"))]
use std::alloc::{GlobalAlloc, Layout};

#[cfg(not(feature = "nightly"))]
use crate::layout::MALLOC_ALIGNMENT;

pub use std::alloc::System;

/// A backing allocator.
///
/// # Implementing
/// The plain paths ([`allocate`](Platform::allocate),
/// [`allocate_zeroed`](Platform::allocate_zeroed) and
/// [`deallocate`](Platform::deallocate)) behave like `malloc`, `calloc` and
/// `free`: returned memory must be aligned to at least
/// [`MALLOC_ALIGNMENT`](crate::layout::MALLOC_ALIGNMENT). The aligned paths
/// behave like `posix_memalign` and its matching free. Sizes are passed back on
/// deallocation for platforms that need them; they are always the sizes that
/// were requested.
///
/// If a request cannot be satisfied, return `None`. The allocators report the
/// failure and return [`Error::OutOfMemory`](crate::error::Error::OutOfMemory)
/// to their caller.
///
/// # Safety
/// Returned memory must be valid for reads and writes of the requested size,
/// must not overlap any other live allocation, and must stay valid until it is
/// passed to the matching deallocation function. A platform must not allocate
/// through the allocator that sits on top of it.
pub unsafe trait Platform: Sync {
    /// Allocate `size` bytes aligned to at least `MALLOC_ALIGNMENT`.
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;
    /// Allocate `size` zeroed bytes aligned to at least `MALLOC_ALIGNMENT`.
    fn allocate_zeroed(&self, size: usize) -> Option<NonNull<u8>>;
    /// Allocate `size` bytes aligned to `align`, a power of two.
    fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>>;
    /// Free memory returned by [`allocate`](Platform::allocate) or
    /// [`allocate_zeroed`](Platform::allocate_zeroed).
    ///
    /// # Safety
    /// `ptr` must have been returned by one of the plain allocation functions
    /// of this platform with the same `size`, and not freed since.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize);
    /// Free memory returned by [`allocate_aligned`](Platform::allocate_aligned).
    ///
    /// # Safety
    /// `ptr` must have been returned by
    /// [`allocate_aligned`](Platform::allocate_aligned) on this platform with
    /// the same `size` and `align`, and not freed since.
    unsafe fn deallocate_aligned(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

#[cfg(not(feature = "nightly"))]
unsafe impl Platform for System {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, MALLOC_ALIGNMENT).ok()?;
        NonNull::new(unsafe { GlobalAlloc::alloc(self, layout) })
    }

    fn allocate_zeroed(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, MALLOC_ALIGNMENT).ok()?;
        NonNull::new(unsafe { GlobalAlloc::alloc_zeroed(self, layout) })
    }

    fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, align).ok()?;
        NonNull::new(unsafe { GlobalAlloc::alloc(self, layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let layout = unsafe { Layout::from_size_align_unchecked(size, MALLOC_ALIGNMENT) };
        unsafe { GlobalAlloc::dealloc(self, ptr.as_ptr(), layout) }
    }

    unsafe fn deallocate_aligned(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
        unsafe { GlobalAlloc::dealloc(self, ptr.as_ptr(), layout) }
    }
}

#[cfg(feature = "nightly")]
unsafe impl<T: core::alloc::Allocator + Sync> Platform for T {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.allocate_aligned(size, crate::layout::MALLOC_ALIGNMENT)
    }

    fn allocate_zeroed(&self, size: usize) -> Option<NonNull<u8>> {
        let layout =
            core::alloc::Layout::from_size_align(size, crate::layout::MALLOC_ALIGNMENT).ok()?;
        let ptr = <Self as core::alloc::Allocator>::allocate_zeroed(self, layout);
        ptr.map(|ptr| ptr.cast()).ok()
    }

    fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let layout = core::alloc::Layout::from_size_align(size, align).ok()?;
        let ptr = <Self as core::alloc::Allocator>::allocate(self, layout);
        ptr.map(|ptr| ptr.cast()).ok()
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        unsafe { self.deallocate_aligned(ptr, size, crate::layout::MALLOC_ALIGNMENT) }
    }

    unsafe fn deallocate_aligned(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let layout = unsafe { core::alloc::Layout::from_size_align_unchecked(size, align) };
        unsafe { <Self as core::alloc::Allocator>::deallocate(self, ptr, layout) }
    }
}
