use crate::{
    block::{BLOCK_HEADER_SIZE, BlockTable, SlotId},
    utils::{GRANULE, align, align_adjustment},
};

/// Linked list to keep track of the free blocks of one page.
///
/// The list does not own any storage. The `next` link of every free block is
/// kept in its slot of the [`BlockTable`], so the list itself is just a head:
///
/// ```text
///                          Free List
///
///          next free block          next free block
///        +-----------------+   +------------------------+
///        |                 v   |                        v
/// +------|--+-------+-------+--|-----+-------+       +------+
/// |  Free   | Block | Free  |  ...   | Block |  ...  | Free |
/// +---------+-------+-------+--------+-------+       +------+
/// ```
///
/// New blocks are pushed at the front, so the list is ordered by insertion
/// time, not by address. [`crate::defrag`] sorts it when coalescing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeList {
    head: Option<SlotId>,
}

/// A free block able to hold a request, and how to carve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fit {
    /// Block before `block` in the list, needed to unlink it.
    pub prev: Option<SlotId>,
    pub block: SlotId,
    /// Padding between the end of the header and the aligned payload.
    pub adjustment: usize,
    /// Payload bytes the allocation will occupy, padding included.
    pub needed: usize,
}

impl FreeList {
    /// Creates a new empty list.
    pub const fn new() -> Self {
        Self { head: None }
    }

    #[inline]
    pub fn head(&self) -> Option<SlotId> {
        self.head
    }

    #[inline]
    pub fn set_head(&mut self, head: Option<SlotId>) {
        self.head = head;
    }

    /// Inserts a free `block` at the front of the list.
    pub fn push_front(&mut self, blocks: &mut BlockTable, block: SlotId) {
        blocks.set_next_free(block, self.head);
        self.head = Some(block);
    }

    /// Removes `block`, whose predecessor in the list is `prev`.
    pub fn unlink(&mut self, blocks: &mut BlockTable, prev: Option<SlotId>, block: SlotId) {
        let next = blocks.next_free(block);

        match prev {
            Some(prev) => blocks.set_next_free(prev, next),
            None => self.head = next,
        }

        blocks.set_next_free(block, None);
    }

    /// Iterates the free blocks in list order.
    pub fn iter<'a>(&self, blocks: &'a BlockTable) -> Iter<'a> {
        Iter {
            blocks,
            current: self.head,
        }
    }

    /// Returns the first block in the list which can hold `size` bytes aligned
    /// to `alignment`, for a page whose first byte is at `page_addr`.
    ///
    /// This is a first-fit search. Alignment is computed from the real address
    /// of each candidate's payload, so two blocks of the same size may differ in
    /// whether they fit.
    pub fn find_first_fit(
        &self,
        blocks: &BlockTable,
        page_addr: usize,
        size: usize,
        alignment: usize,
    ) -> Option<Fit> {
        let mut prev = None;
        let mut current = self.head;

        while let Some(id) = current {
            let slot = blocks.get(id);
            let payload = page_addr + slot.offset + BLOCK_HEADER_SIZE;
            let adjustment = align_adjustment(payload, alignment);
            let needed = block_size_for(size, adjustment);

            if slot.size >= needed {
                return Some(Fit {
                    prev,
                    block: id,
                    adjustment,
                    needed,
                });
            }

            prev = current;
            current = slot.next_free();
        }

        // There is no free block we can use
        None
    }
}

/// Payload bytes a block must have to serve `size` bytes after `adjustment`
/// bytes of padding. Zero sized requests still take one granule.
#[inline]
pub(crate) fn block_size_for(size: usize, adjustment: usize) -> usize {
    align(adjustment + size.max(1), GRANULE)
}

pub(crate) struct Iter<'a> {
    blocks: &'a BlockTable,
    current: Option<SlotId>,
}

impl Iterator for Iter<'_> {
    type Item = SlotId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        self.current = self.blocks.next_free(id);

        Some(id)
    }
}
