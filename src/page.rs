use std::{mem, ptr::NonNull};

use tracing::{debug, info};

use crate::{
    block::{BLOCK_HEADER_SIZE, BlockStamp, BlockTable, SlotId},
    freelist::FreeList,
    kernel::PageMemory,
    stats::Usage,
};

/// Size of every page requested from the kernel.
pub const PAGE_SIZE: usize = 8192;

/// This is the overhead introduced by the page header in bytes. The header
/// holds a [`PageStamp`].
pub const PAGE_HEADER_SIZE: usize = mem::size_of::<PageStamp>();

/// Payload of the single free block a fresh page starts with. No allocation
/// can be larger than this.
pub const PAGE_FREE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE - BLOCK_HEADER_SIZE;

const _: () = assert!(PAGE_SIZE > BLOCK_HEADER_SIZE + PAGE_HEADER_SIZE);

const PAGE_MAGIC: u64 = 0x9A6E_A110_C000_0001;

/// Bytes written at the start of every page.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PageStamp {
    magic: u64,
    index: u64,
}

/// One page of the arena. Pages are carved into blocks, and each page keeps
/// its own free list and counters:
///
/// ```text
/// +--------------------------------------------------------------------+
/// |        | +--------+---------+   +--------+---------+               |
/// | Stamp  | | Header | Payload |   | Header | Payload |   ...         |
/// |        | +--------+---------+   +--------+---------+               |
/// +--------------------------------------------------------------------+
///  <------------------------------ PAGE_SIZE --------------------------->
/// ```
///
/// The free list is singly linked through the block table and ordered by
/// insertion (most recently freed first), not by address.
pub(crate) struct Page {
    memory: PageMemory,
    pub free: FreeList,
    pub usage: Usage,
}

impl Page {
    /// Maps a page and carves it into one free block.
    fn map(index: usize, blocks: &mut BlockTable) -> Option<Self> {
        let mut page = Self {
            memory: PageMemory::map()?,
            free: FreeList::new(),
            usage: Usage::default(),
        };

        page.format(index, blocks);

        Some(page)
    }

    /// Writes the page stamp and turns the whole page into a single free block.
    ///
    /// Any slot previously describing a block of this page must already be retired.
    fn format(&mut self, index: usize, blocks: &mut BlockTable) {
        self.write_stamp(index);

        let id = blocks.insert_free(index, PAGE_HEADER_SIZE, PAGE_FREE_SIZE);
        self.free = FreeList::new();
        self.free.push_front(blocks, id);
        self.usage = Usage {
            free_bytes: PAGE_FREE_SIZE,
            overhead_bytes: PAGE_HEADER_SIZE + BLOCK_HEADER_SIZE,
            free_blocks: 1,
            ..Usage::default()
        };

        self.stamp(id, blocks);
    }

    fn write_stamp(&mut self, index: usize) {
        let stamp = PageStamp {
            magic: PAGE_MAGIC,
            index: index as u64,
        };

        // SAFETY: the page is mapped, page aligned and larger than the stamp.
        unsafe { self.memory.base().cast::<PageStamp>().write(stamp) }
    }

    /// Whether the page stamp still names this page.
    pub fn stamp_matches(&self, index: usize) -> bool {
        // SAFETY: see `write_stamp`.
        let stamp = unsafe { self.memory.base().cast::<PageStamp>().read() };

        stamp.magic == PAGE_MAGIC && stamp.index == index as u64
    }

    /// Writes the header stamp of block `id`, which must live in this page.
    pub fn stamp(&self, id: SlotId, blocks: &BlockTable) {
        let slot = blocks.get(id);
        debug_assert!(slot.end() <= PAGE_SIZE);

        // SAFETY: block headers are granule aligned and lie inside the page.
        unsafe { BlockStamp::write(self.memory.at(slot.offset), id, slot) }
    }

    /// Whether the header stamp of block `id` matches its bookkeeping.
    pub fn stamp_intact(&self, id: SlotId, blocks: &BlockTable) -> bool {
        let slot = blocks.get(id);

        // SAFETY: see `stamp`.
        unsafe { BlockStamp::matches(self.memory.at(slot.offset), id, slot) }
    }

    /// Address of the first byte of the page.
    #[inline]
    pub fn addr(&self) -> usize {
        self.memory.addr()
    }

    /// Pointer `offset` bytes into the page.
    #[inline]
    pub fn at(&self, offset: usize) -> NonNull<u8> {
        self.memory.at(offset)
    }
}

/// Page chain of an allocator. Pages are mapped lazily and only handed back
/// to the kernel by [`PageArena::reset`] or when the arena is dropped.
pub(crate) struct PageArena {
    pages: Vec<Page>,
}

impl PageArena {
    pub const fn new() -> Self {
        Self { pages: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub fn get(&self, index: usize) -> &Page {
        &self.pages[index]
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> &mut Page {
        &mut self.pages[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Page)> {
        self.pages.iter().enumerate()
    }

    /// Page indices in chain order: the most recently mapped page first.
    pub fn chain(&self) -> impl Iterator<Item = usize> + use<> {
        (0..self.pages.len()).rev()
    }

    /// Maps one more page and puts it at the head of the chain.
    /// Returns None when the kernel has no memory left.
    pub fn new_page(&mut self, blocks: &mut BlockTable) -> Option<usize> {
        let index = self.pages.len();
        let page = Page::map(index, blocks)?;

        debug!(page = index, addr = page.addr(), "mapped page");

        self.pages.push(page);
        Some(index)
    }

    /// Recycles the arena.
    ///
    /// With `release_pages` every page but the head of the chain goes back to
    /// the kernel. Remaining pages are reformatted into a single free block
    /// each, without any further syscall. Every block in `blocks` is retired.
    pub fn reset(&mut self, release_pages: bool, blocks: &mut BlockTable) {
        blocks.retire_all();

        let before = self.pages.len();
        if release_pages && before > 1 {
            self.pages.drain(..before - 1);
        }

        for (index, page) in self.pages.iter_mut().enumerate() {
            page.format(index, blocks);
        }

        info!(
            release_pages,
            released = before - self.pages.len(),
            kept = self.pages.len(),
            "arena reset"
        );
    }
}
