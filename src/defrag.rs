//! Incremental coalescing of free blocks.
//!
//! Free lists are kept in insertion order, so two physically adjacent free
//! blocks are rarely next to each other in the list. Defragmenting a page
//! first merge sorts its free list by address and then walks it once, folding
//! every block into its predecessor when the two touch:
//!
//! ```text
//!  before:  [H|free A] [H|free B] [H|used] [H|free C] [H|free D]
//!  after:   [H|free A.........B] [H|used] [H|free C.........D]
//! ```
//!
//! Only a bounded number of pages is processed per call (see
//! [`crate::BlockAllocator::defragment`]), so the cost can be spread over
//! many frames.

use crate::{
    block::{BLOCK_HEADER_SIZE, BlockSlot, BlockTable, SlotId},
    page::Page,
};

/// Whether `cur` starts exactly where `prev` ends.
#[inline]
pub(crate) fn can_merge(prev: &BlockSlot, cur: &BlockSlot) -> bool {
    prev.page == cur.page && cur.offset == prev.end()
}

/// Sorts the free list starting at `head` by block address and returns the new head.
///
/// Classic top-down merge sort: the list is split in halves with a slow and a
/// fast cursor, both halves are sorted, then merged.
pub(crate) fn merge_sort(blocks: &mut BlockTable, head: Option<SlotId>) -> Option<SlotId> {
    let head = head?;
    if blocks.next_free(head).is_none() {
        return Some(head);
    }

    let back = split(blocks, head);
    let front = merge_sort(blocks, Some(head));
    let back = merge_sort(blocks, back);

    merge(blocks, front, back)
}

/// Cuts the list after its middle node and returns the head of the second half.
fn split(blocks: &mut BlockTable, head: SlotId) -> Option<SlotId> {
    let mut slow = head;
    let mut fast = blocks.next_free(head);

    while let Some(step) = fast {
        fast = blocks.next_free(step);
        if let Some(step) = fast {
            fast = blocks.next_free(step);
            if let Some(next) = blocks.next_free(slow) {
                slow = next;
            }
        }
    }

    let back = blocks.next_free(slow);
    blocks.set_next_free(slow, None);
    back
}

/// Merges two address sorted lists.
fn merge(blocks: &mut BlockTable, mut a: Option<SlotId>, mut b: Option<SlotId>) -> Option<SlotId> {
    let mut head = None;
    let mut tail: Option<SlotId> = None;

    loop {
        let next = match (a, b) {
            (Some(x), Some(y)) => {
                if blocks.get(x).offset <= blocks.get(y).offset {
                    a = blocks.next_free(x);
                    x
                } else {
                    b = blocks.next_free(y);
                    y
                }
            }
            (rest @ Some(_), None) | (None, rest @ Some(_)) => {
                match tail {
                    Some(tail) => blocks.set_next_free(tail, rest),
                    None => head = rest,
                }
                return head;
            }
            (None, None) => return head,
        };

        match tail {
            Some(tail) => blocks.set_next_free(tail, Some(next)),
            None => head = Some(next),
        }
        tail = Some(next);
    }
}

/// Sorts and coalesces the free list of `page`. Returns the number of merges.
pub(crate) fn coalesce_page(page: &mut Page, blocks: &mut BlockTable) -> usize {
    let sorted = merge_sort(blocks, page.free.head());
    page.free.set_head(sorted);

    let mut merges = 0;
    let Some(mut prev) = sorted else {
        return 0;
    };

    while let Some(cur) = blocks.next_free(prev) {
        if can_merge(blocks.get(prev), blocks.get(cur)) {
            let absorbed = blocks.get(cur).size;
            let after = blocks.next_free(cur);

            blocks.get_mut(prev).size += BLOCK_HEADER_SIZE + absorbed;
            blocks.set_next_free(prev, after);
            blocks.retire(cur);

            page.usage.merge(BLOCK_HEADER_SIZE);
            merges += 1;
        } else {
            page.stamp(prev, blocks);
            prev = cur;
        }
    }

    page.stamp(prev, blocks);
    merges
}
