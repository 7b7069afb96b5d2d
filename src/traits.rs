//! The capability set every allocator of the crate offers to its consumers.

use std::ptr::NonNull;

use crate::error::AllocResult;

/// Memory allocator interface.
///
/// Consumers (strings, collections, streams) only rely on this contract:
/// memory stays valid until it is deallocated or its last reference is
/// released, `realloc` preserves the first `min(old_size, new_size)` bytes, and
/// only [`Allocator::alloc`] zeroes memory.
pub trait Allocator {
    /// What a caller holds on to for an allocation.
    type Handle: Copy;

    /// Allocates `size` zeroed bytes aligned to `alignment`.
    fn alloc(&mut self, size: usize, alignment: usize) -> AllocResult<Self::Handle>;

    /// Allocates `size` bytes aligned to `alignment` without clearing them.
    fn alloc_uninit(&mut self, size: usize, alignment: usize) -> AllocResult<Self::Handle>;

    /// Gives an allocation back, whatever its reference count.
    fn dealloc(&mut self, handle: Self::Handle) -> AllocResult<()>;

    /// Adds a reference to an allocation.
    fn retain(&mut self, handle: Self::Handle) -> AllocResult<()>;

    /// Drops a reference; the allocation is freed once none remain.
    fn release(&mut self, handle: Self::Handle) -> AllocResult<()>;

    /// Moves the allocation behind `handle` to a fresh one of `new_size` bytes,
    /// copying the first `min(old_size, new_size)` bytes and rewriting `handle`.
    fn realloc(
        &mut self,
        handle: &mut Self::Handle,
        old_size: usize,
        new_size: usize,
    ) -> AllocResult<()>;

    /// First byte of the allocation.
    fn as_ptr(&self, handle: Self::Handle) -> AllocResult<NonNull<u8>>;

    /// Bytes currently handed out.
    fn used(&self) -> usize;

    /// Bytes reserved by the allocator.
    fn capacity(&self) -> usize;
}

impl<A: Allocator + ?Sized> Allocator for &mut A {
    type Handle = A::Handle;

    #[inline]
    fn alloc(&mut self, size: usize, alignment: usize) -> AllocResult<Self::Handle> {
        (**self).alloc(size, alignment)
    }

    #[inline]
    fn alloc_uninit(&mut self, size: usize, alignment: usize) -> AllocResult<Self::Handle> {
        (**self).alloc_uninit(size, alignment)
    }

    #[inline]
    fn dealloc(&mut self, handle: Self::Handle) -> AllocResult<()> {
        (**self).dealloc(handle)
    }

    #[inline]
    fn retain(&mut self, handle: Self::Handle) -> AllocResult<()> {
        (**self).retain(handle)
    }

    #[inline]
    fn release(&mut self, handle: Self::Handle) -> AllocResult<()> {
        (**self).release(handle)
    }

    #[inline]
    fn realloc(
        &mut self,
        handle: &mut Self::Handle,
        old_size: usize,
        new_size: usize,
    ) -> AllocResult<()> {
        (**self).realloc(handle, old_size, new_size)
    }

    #[inline]
    fn as_ptr(&self, handle: Self::Handle) -> AllocResult<NonNull<u8>> {
        (**self).as_ptr(handle)
    }

    #[inline]
    fn used(&self) -> usize {
        (**self).used()
    }

    #[inline]
    fn capacity(&self) -> usize {
        (**self).capacity()
    }
}
