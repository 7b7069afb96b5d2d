//! Ways to share an allocator without a hidden global.
//!
//! A [`crate::BlockAllocator`] is a plain value. Code that needs one either
//! gets it injected, shares a [`SharedAllocator`] across threads, or uses the
//! instance confined to the current thread through [`with_thread_allocator`].

use std::{cell::RefCell, ptr::NonNull, sync::Arc};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    allocator::BlockAllocator,
    block::BlockHandle,
    config::AllocatorConfig,
    error::AllocResult,
    traits::Allocator,
};

/// A [`BlockAllocator`] behind a single mutex. Cloning is cheap and every
/// clone refers to the same arena.
#[derive(Clone, Debug, Default)]
pub struct SharedAllocator {
    inner: Arc<Mutex<BlockAllocator>>,
}

impl SharedAllocator {
    /// Wraps an existing allocator.
    pub fn new(allocator: BlockAllocator) -> Self {
        Self {
            inner: Arc::new(Mutex::new(allocator)),
        }
    }

    /// Builds a shared allocator from `config`.
    pub fn with_config(config: AllocatorConfig) -> AllocResult<Self> {
        Ok(Self::new(BlockAllocator::with_config(config)?))
    }

    /// Locks the allocator for a sequence of operations.
    pub fn lock(&self) -> MutexGuard<'_, BlockAllocator> {
        self.inner.lock()
    }

    /// Runs `f` with the allocator locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut BlockAllocator) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl Allocator for SharedAllocator {
    type Handle = BlockHandle;

    fn alloc(&mut self, size: usize, alignment: usize) -> AllocResult<BlockHandle> {
        self.lock().alloc(size, alignment)
    }

    fn alloc_uninit(&mut self, size: usize, alignment: usize) -> AllocResult<BlockHandle> {
        self.lock().alloc_uninit(size, alignment)
    }

    fn dealloc(&mut self, handle: BlockHandle) -> AllocResult<()> {
        self.lock().dealloc(handle)
    }

    fn retain(&mut self, handle: BlockHandle) -> AllocResult<()> {
        self.lock().retain(handle).map(|_| ())
    }

    fn release(&mut self, handle: BlockHandle) -> AllocResult<()> {
        self.lock().release(handle).map(|_| ())
    }

    fn realloc(
        &mut self,
        handle: &mut BlockHandle,
        old_size: usize,
        new_size: usize,
    ) -> AllocResult<()> {
        self.lock().realloc(handle, old_size, new_size)
    }

    fn as_ptr(&self, handle: BlockHandle) -> AllocResult<NonNull<u8>> {
        self.lock().as_ptr(handle)
    }

    fn used(&self) -> usize {
        self.lock().used()
    }

    fn capacity(&self) -> usize {
        self.lock().capacity()
    }
}

thread_local! {
    static THREAD_ALLOCATOR: RefCell<BlockAllocator> = const { RefCell::new(BlockAllocator::new()) };
}

/// Runs `f` with the allocator owned by the current thread.
///
/// The allocator maps no memory until first used and is dropped, pages and
/// all, when the thread exits.
///
/// # Panics
///
/// Panics if called again from inside `f`.
pub fn with_thread_allocator<R>(f: impl FnOnce(&mut BlockAllocator) -> R) -> R {
    THREAD_ALLOCATOR.with(|allocator| f(&mut allocator.borrow_mut()))
}
