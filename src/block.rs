//! Typed handles to allocated payloads.

use core::{
    fmt::{Debug, Pointer},
    hash::{Hash, Hasher},
    marker::PhantomData,
    ptr::NonNull,
};

/// A pointer to a payload allocated by `A`.
///
/// The type parameter ties each block to the allocator type that produced it,
/// so a block from a [`Guarded`](crate::Guarded) allocator cannot be passed to
/// a [`LockFree`](crate::LockFree) one, or the other way around.
///
/// A block is a plain address: it is `Copy`, it does not borrow its allocator
/// and it does not free anything when dropped. Every operation that reads
/// through it is `unsafe`.
#[repr(transparent)]
pub struct Block<A: ?Sized> {
    ptr: NonNull<u8>,
    _allocator: PhantomData<fn() -> *const A>,
}
impl<A: ?Sized> Block<A> {
    /// Wraps a payload pointer.
    ///
    /// # Safety
    /// `ptr` must be a payload pointer returned by an allocator of type `A`,
    /// or the block must only be passed to operations that are documented to
    /// detect foreign pointers.
    pub const unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
        Self {
            ptr,
            _allocator: PhantomData,
        }
    }

    /// The payload pointer.
    pub const fn as_non_null(self) -> NonNull<u8> {
        self.ptr
    }

    /// The payload pointer.
    pub const fn as_ptr(self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The payload pointer, cast to `T`.
    pub const fn cast<T>(self) -> NonNull<T> {
        self.ptr.cast()
    }

    /// The payload address.
    pub fn addr(self) -> usize {
        self.ptr.as_ptr() as usize
    }
}
impl<A: ?Sized> Clone for Block<A> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<A: ?Sized> Copy for Block<A> {}
impl<A: ?Sized> PartialEq for Block<A> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}
impl<A: ?Sized> Eq for Block<A> {}
impl<A: ?Sized> Hash for Block<A> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.hash(state)
    }
}
impl<A: ?Sized> Debug for Block<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Block({:p})", self.ptr)
    }
}
impl<A: ?Sized> Pointer for Block<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        Pointer::fmt(&self.ptr, f)
    }
}
unsafe impl<A: ?Sized> Send for Block<A> {}
unsafe impl<A: ?Sized> Sync for Block<A> {}
