//! The paged block allocator.

use std::{fmt, ptr::NonNull};

use tracing::{debug, trace, warn};

use crate::{
    block::{BLOCK_HEADER_SIZE, BlockHandle, BlockState, BlockTable, SlotId},
    config::AllocatorConfig,
    defrag,
    error::{AllocError, AllocResult},
    freelist::Fit,
    page::{PAGE_FREE_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE, PageArena},
    stats::{AllocatorStats, DefragReport, FreeBlock, PageStats, Usage},
    traits::Allocator,
    utils::is_valid_alignment,
};

/// Pass to [`BlockAllocator::defragment`] to visit every page once.
pub const ALL_PAGES: usize = usize::MAX;

/// General purpose allocator carving fixed-size pages into variable-size blocks.
///
/// Allocation walks the pages newest first and takes the first free block
/// large enough for the request, splitting off the tail when enough is left
/// over. When no page has room a new one is mapped. Freed blocks go to the
/// front of their page's free list and are merged with the list head when the
/// two are adjacent; full coalescing is left to [`BlockAllocator::defragment`],
/// which can be run a few pages at a time.
///
/// # Thread Safety
///
/// The allocator is NOT thread-safe. Share it through
/// [`crate::SharedAllocator`] or keep one per thread with
/// [`crate::with_thread_allocator`].
///
/// # Example
///
/// ```
/// use pagealloc::BlockAllocator;
///
/// let mut allocator = BlockAllocator::new();
///
/// let handle = allocator.alloc(64, 16)?;
/// allocator.bytes_mut(handle)?.copy_from_slice(&[7; 64]);
///
/// allocator.release(handle)?;
/// # Ok::<(), pagealloc::AllocError>(())
/// ```
pub struct BlockAllocator {
    pages: PageArena,
    blocks: BlockTable,
    /// Arena totals, mirrored from the page counters.
    totals: Usage,
    /// Next page due for defragmentation.
    cursor: usize,
    config: AllocatorConfig,
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockAllocator {
    /// Creates an allocator with the default configuration and no pages.
    pub const fn new() -> Self {
        Self {
            pages: PageArena::new(),
            blocks: BlockTable::new(),
            totals: Usage {
                free_bytes: 0,
                allocated_bytes: 0,
                overhead_bytes: 0,
                free_blocks: 0,
                allocated_blocks: 0,
            },
            cursor: 0,
            config: AllocatorConfig {
                max_pages: None,
                initial_pages: 0,
                defrag_pages_per_step: crate::config::DEFAULT_DEFRAG_PAGES_PER_STEP,
            },
        }
    }

    /// Creates an allocator from `config`, mapping its initial pages right away.
    pub fn with_config(config: AllocatorConfig) -> AllocResult<Self> {
        config.validate()?;

        let mut allocator = Self {
            config,
            ..Self::new()
        };

        for _ in 0..allocator.config.initial_pages {
            allocator.grow(0)?;
        }

        Ok(allocator)
    }

    /// Configuration in use.
    #[inline]
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Allocates `size` zeroed bytes aligned to `alignment`.
    ///
    /// `alignment` must be a power of two no larger than 128, and the request
    /// must fit in a single page: `size + alignment - 1 <= PAGE_FREE_SIZE`.
    /// The returned block has a reference count of one.
    pub fn alloc(&mut self, size: usize, alignment: usize) -> AllocResult<BlockHandle> {
        let handle = self.alloc_uninit(size, alignment)?;
        let ptr = self.payload(SlotId(handle.slot));

        // SAFETY: the payload holds at least `size` bytes owned by this block.
        unsafe { ptr.as_ptr().write_bytes(0, size) }

        Ok(handle)
    }

    /// Same as [`BlockAllocator::alloc`], but leaves whatever the memory
    /// previously held in place.
    pub fn alloc_uninit(&mut self, size: usize, alignment: usize) -> AllocResult<BlockHandle> {
        check_request(size, alignment)?;

        let found = self.pages.chain().find_map(|index| {
            let page = self.pages.get(index);
            page.free
                .find_first_fit(&self.blocks, page.addr(), size, alignment)
                .map(|fit| (index, fit))
        });

        let (index, fit) = match found {
            Some(found) => found,
            None => {
                let index = self.grow(size)?;
                let page = self.pages.get(index);
                let fit = page
                    .free
                    .find_first_fit(&self.blocks, page.addr(), size, alignment)
                    .ok_or(AllocError::RequestTooLarge {
                        requested: size,
                        alignment,
                        max: PAGE_FREE_SIZE,
                    })?;
                (index, fit)
            }
        };

        let id = self.carve(index, fit, size, alignment);
        let handle = self.blocks.handle(id);

        trace!(
            page = index,
            slot = handle.slot,
            size,
            alignment,
            block = fit.needed,
            "alloc"
        );

        Ok(handle)
    }

    /// Maps a new page, honouring the configured page cap.
    fn grow(&mut self, requested: usize) -> AllocResult<usize> {
        let pages = self.pages.len();
        let out_of_memory = AllocError::OutOfMemory { requested, pages };

        if self.config.max_pages.is_some_and(|max| pages >= max) {
            warn!(requested, pages, "page limit reached");
            return Err(out_of_memory);
        }

        let Some(index) = self.pages.new_page(&mut self.blocks) else {
            warn!(requested, pages, "kernel refused to map a page");
            return Err(out_of_memory);
        };

        self.totals.absorb(&self.pages.get(index).usage);
        Ok(index)
    }

    /// Turns the free block picked by `fit` into an allocation, splitting off
    /// the tail when it can hold more than a header.
    fn carve(&mut self, index: usize, fit: Fit, size: usize, alignment: usize) -> SlotId {
        let page = self.pages.get_mut(index);
        page.free.unlink(&mut self.blocks, fit.prev, fit.block);

        let block = *self.blocks.get(fit.block);
        let remaining = block.size - fit.needed;

        if remaining > BLOCK_HEADER_SIZE {
            let offset = block.offset + BLOCK_HEADER_SIZE + fit.needed;
            let tail = self
                .blocks
                .insert_free(index, offset, remaining - BLOCK_HEADER_SIZE);
            page.free.push_front(&mut self.blocks, tail);
            page.stamp(tail, &self.blocks);

            self.blocks.get_mut(fit.block).size = fit.needed;
            page.usage.take_split(fit.needed, BLOCK_HEADER_SIZE);
            self.totals.take_split(fit.needed, BLOCK_HEADER_SIZE);
        } else {
            page.usage.take_whole(block.size);
            self.totals.take_whole(block.size);
        }

        self.blocks.get_mut(fit.block).state = BlockState::Allocated {
            ref_count: 1,
            adjustment: fit.adjustment as u8,
            alignment: alignment as u8,
            requested: size,
        };
        page.stamp(fit.block, &self.blocks);

        fit.block
    }

    /// Gives the block back to its page, whatever its reference count.
    ///
    /// The block is pushed to the front of the page's free list, or merged
    /// into the current head when the two are adjacent.
    pub fn dealloc(&mut self, handle: BlockHandle) -> AllocResult<()> {
        let id = self.resolve(handle)?;
        self.free_block(id);

        Ok(())
    }

    fn free_block(&mut self, id: SlotId) {
        let block = *self.blocks.get(id);
        let page = self.pages.get_mut(block.page);

        page.usage.give_back(block.size);
        self.totals.give_back(block.size);
        self.blocks.mark_free(id);

        trace!(page = block.page, slot = id.0, size = block.size, "dealloc");

        match page.free.head() {
            // The head sits right before the block: it absorbs it.
            Some(head) if defrag::can_merge(self.blocks.get(head), self.blocks.get(id)) => {
                self.blocks.get_mut(head).size += BLOCK_HEADER_SIZE + block.size;
                self.blocks.retire(id);
                page.stamp(head, &self.blocks);
            }
            // The block sits right before the head: it takes the head's place.
            Some(head) if defrag::can_merge(self.blocks.get(id), self.blocks.get(head)) => {
                let absorbed = self.blocks.get(head).size;
                let after = self.blocks.next_free(head);

                self.blocks.get_mut(id).size += BLOCK_HEADER_SIZE + absorbed;
                self.blocks.set_next_free(id, after);
                self.blocks.retire(head);
                page.free.set_head(Some(id));
                page.stamp(id, &self.blocks);
            }
            _ => {
                page.free.push_front(&mut self.blocks, id);
                page.stamp(id, &self.blocks);
                return;
            }
        }

        page.usage.merge(BLOCK_HEADER_SIZE);
        self.totals.merge(BLOCK_HEADER_SIZE);
    }

    /// Adds a reference to the block and returns the new count.
    pub fn retain(&mut self, handle: BlockHandle) -> AllocResult<u32> {
        let id = self.resolve(handle)?;

        match &mut self.blocks.get_mut(id).state {
            BlockState::Allocated { ref_count, .. } => {
                *ref_count = ref_count.saturating_add(1);
                Ok(*ref_count)
            }
            _ => Err(stale(handle)),
        }
    }

    /// Drops a reference and returns how many remain. The block is
    /// deallocated when the count reaches zero.
    pub fn release(&mut self, handle: BlockHandle) -> AllocResult<u32> {
        let id = self.resolve(handle)?;

        let remaining = match &mut self.blocks.get_mut(id).state {
            BlockState::Allocated { ref_count, .. } => {
                *ref_count -= 1;
                *ref_count
            }
            _ => return Err(stale(handle)),
        };

        if remaining == 0 {
            self.free_block(id);
        }

        Ok(remaining)
    }

    /// Moves the allocation to a new block of `new_size` bytes with the same
    /// alignment, copying the first `min(old_size, new_size)` bytes. The old
    /// handle loses one reference and `handle` is rewritten to the new block.
    ///
    /// No attempt is made to grow the block in place. Bytes past the copied
    /// range are zero.
    pub fn realloc(
        &mut self,
        handle: &mut BlockHandle,
        old_size: usize,
        new_size: usize,
    ) -> AllocResult<()> {
        let id = self.resolve(*handle)?;
        let (requested, alignment) = match self.blocks.get(id).state {
            BlockState::Allocated {
                requested,
                alignment,
                ..
            } => (requested, alignment as usize),
            _ => return Err(stale(*handle)),
        };

        let moved = self.alloc(new_size, alignment)?;
        let copy = old_size.min(new_size).min(requested);

        // SAFETY: both payloads hold at least `copy` bytes and belong to
        // different blocks, so they cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.payload(id).as_ptr(),
                self.payload(SlotId(moved.slot)).as_ptr(),
                copy,
            );
        }

        self.release(*handle)?;
        *handle = moved;

        Ok(())
    }

    /// Sorts and coalesces the free lists of at most `max_pages` pages.
    ///
    /// Pages are swept by index, oldest mapped page first, which is the
    /// reverse of the order allocation scans them in. The sweep resumes where
    /// the previous call stopped and wraps around to the oldest page, so
    /// calling this once per frame with a small budget eventually visits the
    /// whole arena at a bounded cost per call.
    pub fn defragment(&mut self, max_pages: usize) -> DefragReport {
        let mut report = DefragReport::default();
        let visits = max_pages.min(self.pages.len());

        for _ in 0..visits {
            if self.cursor >= self.pages.len() {
                self.cursor = 0;
            }

            let index = self.cursor;
            self.cursor = (index + 1) % self.pages.len();

            let merges = defrag::coalesce_page(self.pages.get_mut(index), &mut self.blocks);
            for _ in 0..merges {
                self.totals.merge(BLOCK_HEADER_SIZE);
            }

            report.pages_visited += 1;
            report.merges += merges;
        }

        if report.pages_visited > 0 {
            debug!(
                pages = report.pages_visited,
                merges = report.merges,
                cursor = self.cursor,
                "defragmented"
            );
        }

        report
    }

    /// One incremental defragmentation step using the configured page budget.
    pub fn defragment_step(&mut self) -> DefragReport {
        self.defragment(self.config.defrag_pages_per_step)
    }

    /// Frees everything at once.
    ///
    /// With `release_pages` every page but one goes back to the kernel;
    /// otherwise all pages are kept and simply reformatted, which avoids
    /// syscalls when the arena is recycled every frame. Every outstanding
    /// handle becomes stale.
    pub fn reset(&mut self, release_pages: bool) {
        self.pages.reset(release_pages, &mut self.blocks);
        self.cursor = 0;

        self.totals = Usage::default();
        for (_, page) in self.pages.iter() {
            self.totals.absorb(&page.usage);
        }
    }

    /// Payload bytes handed out, alignment padding included.
    #[inline]
    pub fn used(&self) -> usize {
        self.totals.allocated_bytes
    }

    /// Bytes reserved from the kernel.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    /// Number of mapped pages.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// First byte of the allocation.
    pub fn as_ptr(&self, handle: BlockHandle) -> AllocResult<NonNull<u8>> {
        let id = self.resolve(handle)?;

        Ok(self.payload(id))
    }

    /// Size requested when the block was allocated.
    pub fn size_of(&self, handle: BlockHandle) -> AllocResult<usize> {
        let id = self.resolve(handle)?;

        match self.blocks.get(id).state {
            BlockState::Allocated { requested, .. } => Ok(requested),
            _ => Err(stale(handle)),
        }
    }

    /// Current reference count of the block.
    pub fn ref_count(&self, handle: BlockHandle) -> AllocResult<u32> {
        let id = self.resolve(handle)?;

        match self.blocks.get(id).state {
            BlockState::Allocated { ref_count, .. } => Ok(ref_count),
            _ => Err(stale(handle)),
        }
    }

    /// Whether `handle` still names a live allocation.
    #[inline]
    pub fn is_live(&self, handle: BlockHandle) -> bool {
        self.blocks.resolve(handle).is_some()
    }

    /// The requested bytes of the allocation.
    pub fn bytes(&self, handle: BlockHandle) -> AllocResult<&[u8]> {
        let len = self.size_of(handle)?;
        let ptr = self.as_ptr(handle)?;

        // SAFETY: the block is live and its payload holds `len` bytes; the
        // shared borrow of the allocator keeps it alive and unmodified.
        Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) })
    }

    /// The requested bytes of the allocation, writable.
    pub fn bytes_mut(&mut self, handle: BlockHandle) -> AllocResult<&mut [u8]> {
        let len = self.size_of(handle)?;
        let ptr = self.as_ptr(handle)?;

        // SAFETY: as in `bytes`, with the exclusive borrow ruling out aliases.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) })
    }

    /// Snapshot of the whole arena.
    pub fn stats(&self) -> AllocatorStats {
        let largest_free_block = self
            .pages
            .iter()
            .map(|(index, _)| self.largest_free(index))
            .max()
            .unwrap_or(0);

        AllocatorStats {
            pages: self.pages.len(),
            capacity: self.capacity(),
            usage: self.totals,
            largest_free_block,
        }
    }

    /// Snapshot of page `index`, or None if there is no such page.
    pub fn page_stats(&self, index: usize) -> Option<PageStats> {
        if index >= self.pages.len() {
            return None;
        }

        Some(PageStats {
            index,
            usage: self.pages.get(index).usage,
            largest_free_block: self.largest_free(index),
        })
    }

    /// Free blocks of page `index` in free list order.
    pub fn free_blocks(&self, index: usize) -> Option<Vec<FreeBlock>> {
        if index >= self.pages.len() {
            return None;
        }

        let blocks = self
            .pages
            .get(index)
            .free
            .iter(&self.blocks)
            .map(|id| {
                let slot = self.blocks.get(id);
                FreeBlock {
                    offset: slot.offset,
                    size: slot.size,
                }
            })
            .collect();

        Some(blocks)
    }

    fn largest_free(&self, index: usize) -> usize {
        self.pages
            .get(index)
            .free
            .iter(&self.blocks)
            .map(|id| self.blocks.get(id).size)
            .max()
            .unwrap_or(0)
    }

    /// Walks every page and checks that bookkeeping and memory agree.
    ///
    /// The blocks of each page must tile it exactly, every page and block
    /// header stamp must be intact, page counters must match the blocks and
    /// add up to [`PAGE_SIZE`], free lists must hold exactly the free blocks of
    /// their page, and arena totals must be the sum of the pages.
    pub fn verify(&self) -> AllocResult<()> {
        let mut per_page: Vec<Vec<SlotId>> = vec![Vec::new(); self.pages.len()];
        for (id, slot) in self.blocks.blocks() {
            match per_page.get_mut(slot.page) {
                Some(ids) => ids.push(id),
                None => {
                    return Err(AllocError::Corrupted {
                        page: slot.page,
                        reason: format!("block in slot {} belongs to an unmapped page", id.0),
                    });
                }
            }
        }

        let mut sum = Usage::default();

        for ((index, page), ids) in self.pages.iter().zip(per_page.iter_mut()) {
            let corrupted = |reason: String| AllocError::Corrupted {
                page: index,
                reason,
            };

            if !page.stamp_matches(index) {
                return Err(corrupted("page header overwritten".to_string()));
            }

            if page.usage.total() != PAGE_SIZE {
                return Err(corrupted(format!(
                    "counters account for {} bytes",
                    page.usage.total()
                )));
            }

            ids.sort_by_key(|id| self.blocks.get(*id).offset);

            let mut expected = PAGE_HEADER_SIZE;
            let mut usage = Usage {
                overhead_bytes: PAGE_HEADER_SIZE,
                ..Usage::default()
            };

            for &id in ids.iter() {
                let slot = self.blocks.get(id);

                if slot.offset != expected {
                    return Err(corrupted(format!(
                        "block at offset {} where {expected} was expected",
                        slot.offset
                    )));
                }

                if !page.stamp_intact(id, &self.blocks) {
                    return Err(corrupted(format!(
                        "header of block at offset {} overwritten",
                        slot.offset
                    )));
                }

                usage.overhead_bytes += BLOCK_HEADER_SIZE;
                if slot.is_free() {
                    usage.free_bytes += slot.size;
                    usage.free_blocks += 1;
                } else {
                    usage.allocated_bytes += slot.size;
                    usage.allocated_blocks += 1;
                }

                expected = slot.end();
            }

            if expected != PAGE_SIZE {
                return Err(corrupted(format!("blocks end at offset {expected}")));
            }

            if usage != page.usage {
                return Err(corrupted(format!(
                    "counters {:?} disagree with blocks {usage:?}",
                    page.usage
                )));
            }

            let mut listed = 0;
            for id in page.free.iter(&self.blocks) {
                let slot = self.blocks.get(id);
                listed += 1;

                if listed > usage.free_blocks {
                    return Err(corrupted("free list longer than free block count".to_string()));
                }

                if !slot.is_free() || slot.page != index {
                    return Err(corrupted(format!(
                        "free list links foreign block in slot {}",
                        id.0
                    )));
                }
            }

            if listed != usage.free_blocks {
                return Err(corrupted(format!(
                    "free list holds {listed} of {} free blocks",
                    usage.free_blocks
                )));
            }

            sum.absorb(&usage);
        }

        if sum != self.totals {
            return Err(AllocError::TotalsDrifted(format!(
                "totals {:?}, pages add up to {sum:?}",
                self.totals
            )));
        }

        Ok(())
    }

    fn resolve(&self, handle: BlockHandle) -> AllocResult<SlotId> {
        self.blocks.resolve(handle).ok_or(stale(handle))
    }

    /// Aligned payload of the allocation held in `id`.
    fn payload(&self, id: SlotId) -> NonNull<u8> {
        let slot = self.blocks.get(id);
        let adjustment = match slot.state {
            BlockState::Allocated { adjustment, .. } => adjustment as usize,
            _ => 0,
        };

        self.pages
            .get(slot.page)
            .at(slot.offset + BLOCK_HEADER_SIZE + adjustment)
    }
}

impl fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("pages", &self.pages.len())
            .field("blocks", &self.blocks.live())
            .field("totals", &self.totals)
            .field("cursor", &self.cursor)
            .field("config", &self.config)
            .finish()
    }
}

fn check_request(size: usize, alignment: usize) -> AllocResult<()> {
    if !is_valid_alignment(alignment) {
        return Err(AllocError::InvalidAlignment(alignment));
    }

    if size.saturating_add(alignment - 1) > PAGE_FREE_SIZE {
        return Err(AllocError::RequestTooLarge {
            requested: size,
            alignment,
            max: PAGE_FREE_SIZE,
        });
    }

    Ok(())
}

#[inline]
fn stale(handle: BlockHandle) -> AllocError {
    AllocError::StaleHandle {
        slot: handle.slot,
        generation: handle.generation,
    }
}

impl Allocator for BlockAllocator {
    type Handle = BlockHandle;

    fn alloc(&mut self, size: usize, alignment: usize) -> AllocResult<BlockHandle> {
        BlockAllocator::alloc(self, size, alignment)
    }

    fn alloc_uninit(&mut self, size: usize, alignment: usize) -> AllocResult<BlockHandle> {
        BlockAllocator::alloc_uninit(self, size, alignment)
    }

    fn dealloc(&mut self, handle: BlockHandle) -> AllocResult<()> {
        BlockAllocator::dealloc(self, handle)
    }

    fn retain(&mut self, handle: BlockHandle) -> AllocResult<()> {
        BlockAllocator::retain(self, handle).map(|_| ())
    }

    fn release(&mut self, handle: BlockHandle) -> AllocResult<()> {
        BlockAllocator::release(self, handle).map(|_| ())
    }

    fn realloc(
        &mut self,
        handle: &mut BlockHandle,
        old_size: usize,
        new_size: usize,
    ) -> AllocResult<()> {
        BlockAllocator::realloc(self, handle, old_size, new_size)
    }

    fn as_ptr(&self, handle: BlockHandle) -> AllocResult<NonNull<u8>> {
        BlockAllocator::as_ptr(self, handle)
    }

    fn used(&self) -> usize {
        BlockAllocator::used(self)
    }

    fn capacity(&self) -> usize {
        BlockAllocator::capacity(self)
    }
}
