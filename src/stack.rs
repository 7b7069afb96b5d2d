//! # Stack Allocator
//!
//! A bump-pointer allocator for scratch memory that is released in bulk.

use std::{fmt, ptr::NonNull};

use tracing::{debug, warn};

use crate::{
    error::{AllocError, AllocResult},
    traits::Allocator,
    utils::{align_adjustment, is_valid_alignment},
};

/// A position in a [`StackAllocator`], used to free everything allocated after it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Marker(usize);

/// A bump-pointer allocator living inside a single block of a parent allocator.
///
/// Allocations are just a cursor move: there are no per-allocation headers
/// and no free list. Memory is released all at once with
/// [`StackAllocator::reset`], or back to a [`Marker`] with
/// [`StackAllocator::revert_to`]. The parent block is returned when the stack
/// is dropped.
///
/// The block is looked up in the parent on every allocation, so once the
/// parent has released it (for instance through a reset of a shared
/// allocator) the stack reports [`AllocError::StaleHandle`] instead of
/// handing out memory it no longer owns.
///
/// # Thread Safety
///
/// This allocator is NOT thread-safe. Use one stack per thread.
///
/// # Example
///
/// ```
/// use pagealloc::{BlockAllocator, StackAllocator};
///
/// let mut parent = BlockAllocator::new();
/// let mut stack = StackAllocator::new(&mut parent, 1024, 16)?;
///
/// let frame = stack.marker();
/// let scratch = stack.alloc(256, 8)?;
/// unsafe { scratch.as_ptr().write_bytes(0xAA, 256) };
///
/// // Everything allocated after `frame` is gone.
/// stack.revert_to(frame)?;
/// assert_eq!(stack.used(), 0);
/// # Ok::<(), pagealloc::AllocError>(())
/// ```
pub struct StackAllocator<A: Allocator> {
    parent: A,
    /// The single block obtained from `parent`.
    block: A::Handle,
    /// Offsets from the first byte of `block`.
    start: usize,
    cursor: usize,
    end: usize,
    alignment: usize,
}

impl<A: Allocator> StackAllocator<A> {
    /// Reserves `size` bytes from `parent`, with the start of the stack
    /// aligned to `alignment`.
    pub fn new(mut parent: A, size: usize, alignment: usize) -> AllocResult<Self> {
        if !is_valid_alignment(alignment) {
            return Err(AllocError::InvalidAlignment(alignment));
        }

        let reserved = size
            .checked_add(alignment)
            .ok_or(AllocError::RequestTooLarge {
                requested: size,
                alignment,
                max: usize::MAX - alignment,
            })?;

        let block = parent.alloc(reserved, 1)?;
        let base = match parent.as_ptr(block) {
            Ok(base) => base,
            Err(error) => {
                let _ = parent.dealloc(block);
                return Err(error);
            }
        };

        let start = align_adjustment(base.as_ptr() as usize, alignment);

        debug!(size, alignment, base = ?base, "stack allocator created");

        Ok(Self {
            parent,
            block,
            start,
            cursor: start,
            end: start + size,
            alignment,
        })
    }

    /// Bumps the cursor past `bytes` bytes aligned to `alignment` and returns
    /// the first of them. The memory is not cleared.
    pub fn alloc(&mut self, bytes: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        if !is_valid_alignment(alignment) {
            return Err(AllocError::InvalidAlignment(alignment));
        }

        let base = self.base()?;
        let adjustment = align_adjustment(base.as_ptr() as usize + self.cursor, alignment);
        let requested = adjustment.saturating_add(bytes);
        let remaining = self.remaining();

        if requested > remaining {
            return Err(AllocError::StackOverflow {
                requested,
                remaining,
            });
        }

        let offset = self.cursor + adjustment;
        self.cursor += requested;

        Ok(at(base, offset))
    }

    /// Current cursor position.
    #[inline]
    pub fn marker(&self) -> Marker {
        Marker(self.cursor)
    }

    /// Frees everything allocated after `marker` was taken.
    pub fn revert_to(&mut self, marker: Marker) -> AllocResult<()> {
        if marker.0 < self.start || marker.0 > self.cursor {
            return Err(AllocError::InvalidMarker {
                marker: marker.0,
                cursor: self.cursor,
            });
        }

        self.cursor = marker.0;
        Ok(())
    }

    /// Frees everything.
    #[inline]
    pub fn reset(&mut self) {
        self.cursor = self.start;
    }

    /// Bytes between the start of the stack and the cursor.
    #[inline]
    pub fn used(&self) -> usize {
        self.cursor - self.start
    }

    /// Total bytes of the stack.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }

    /// Bytes left before the stack overflows.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.end - self.cursor
    }

    /// Alignment of the start of the stack.
    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// The allocator the stack's block came from.
    #[inline]
    pub fn parent(&self) -> &A {
        &self.parent
    }

    /// First byte of the parent block, or `StaleHandle` once the parent
    /// no longer holds it.
    #[inline]
    fn base(&self) -> AllocResult<NonNull<u8>> {
        self.parent.as_ptr(self.block)
    }
}

#[inline]
fn at(base: NonNull<u8>, offset: usize) -> NonNull<u8> {
    // SAFETY: offsets never exceed `end`, which lies inside the parent block.
    unsafe { base.add(offset) }
}

impl<A: Allocator> Allocator for StackAllocator<A> {
    type Handle = NonNull<u8>;

    fn alloc(&mut self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        let ptr = StackAllocator::alloc(self, size, alignment)?;

        // SAFETY: the `size` bytes at `ptr` were just reserved.
        unsafe { ptr.as_ptr().write_bytes(0, size) }

        Ok(ptr)
    }

    fn alloc_uninit(&mut self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        StackAllocator::alloc(self, size, alignment)
    }

    /// Individual allocations cannot be freed; use markers instead.
    fn dealloc(&mut self, _handle: NonNull<u8>) -> AllocResult<()> {
        Ok(())
    }

    fn retain(&mut self, _handle: NonNull<u8>) -> AllocResult<()> {
        Ok(())
    }

    fn release(&mut self, _handle: NonNull<u8>) -> AllocResult<()> {
        Ok(())
    }

    /// Copies the allocation to fresh space at the top of the stack.
    fn realloc(
        &mut self,
        handle: &mut NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> AllocResult<()> {
        let base = self.base()?;
        let offset = (handle.as_ptr() as usize).wrapping_sub(base.as_ptr() as usize);
        if offset < self.start || offset.saturating_add(old_size) > self.cursor {
            return Err(AllocError::InvalidMarker {
                marker: offset,
                cursor: self.cursor,
            });
        }

        let moved = StackAllocator::alloc(self, new_size, self.alignment)?;

        // SAFETY: the old range lies below the previous cursor and the new one
        // above it, both inside the stack.
        unsafe {
            std::ptr::copy_nonoverlapping(
                at(base, offset).as_ptr(),
                moved.as_ptr(),
                old_size.min(new_size),
            );
        }

        *handle = moved;
        Ok(())
    }

    fn as_ptr(&self, handle: NonNull<u8>) -> AllocResult<NonNull<u8>> {
        Ok(handle)
    }

    fn used(&self) -> usize {
        StackAllocator::used(self)
    }

    fn capacity(&self) -> usize {
        StackAllocator::capacity(self)
    }
}

impl<A: Allocator> Drop for StackAllocator<A> {
    fn drop(&mut self) {
        if let Err(error) = self.parent.dealloc(self.block) {
            warn!(%error, "failed to give the stack block back to its parent");
        }
    }
}

impl<A: Allocator> fmt::Debug for StackAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackAllocator")
            .field("used", &self.used())
            .field("capacity", &self.capacity())
            .field("alignment", &self.alignment)
            .finish()
    }
}
