//! Usage counters and reports.

use serde::Serialize;

/// Byte and block counters of one page, or of the whole arena.
///
/// For every page `free_bytes + allocated_bytes + overhead_bytes` is always
/// exactly [`crate::PAGE_SIZE`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    /// Payload bytes of free blocks.
    pub free_bytes: usize,
    /// Payload bytes of allocated blocks, alignment padding included.
    pub allocated_bytes: usize,
    /// Page and block headers.
    pub overhead_bytes: usize,
    /// Blocks linked in free lists.
    pub free_blocks: usize,
    /// Blocks handed out to callers.
    pub allocated_blocks: usize,
}

impl Usage {
    /// Sum of every byte accounted for.
    #[inline]
    pub fn total(&self) -> usize {
        self.free_bytes + self.allocated_bytes + self.overhead_bytes
    }

    /// Adds `other` into `self`.
    pub(crate) fn absorb(&mut self, other: &Usage) {
        self.free_bytes += other.free_bytes;
        self.allocated_bytes += other.allocated_bytes;
        self.overhead_bytes += other.overhead_bytes;
        self.free_blocks += other.free_blocks;
        self.allocated_blocks += other.allocated_blocks;
    }

    /// A free block of `size` bytes was handed out whole.
    pub(crate) fn take_whole(&mut self, size: usize) {
        self.free_bytes -= size;
        self.allocated_bytes += size;
        self.free_blocks -= 1;
        self.allocated_blocks += 1;
    }

    /// `taken` bytes were carved from the front of a free block; the rest
    /// stays free behind a new header.
    pub(crate) fn take_split(&mut self, taken: usize, header: usize) {
        self.free_bytes -= taken + header;
        self.allocated_bytes += taken;
        self.overhead_bytes += header;
        self.allocated_blocks += 1;
    }

    /// An allocated block of `size` bytes went back to the free list.
    pub(crate) fn give_back(&mut self, size: usize) {
        self.allocated_bytes -= size;
        self.free_bytes += size;
        self.allocated_blocks -= 1;
        self.free_blocks += 1;
    }

    /// Two free blocks became one; the header between them is payload now.
    pub(crate) fn merge(&mut self, header: usize) {
        self.overhead_bytes -= header;
        self.free_bytes += header;
        self.free_blocks -= 1;
    }
}

/// Snapshot of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageStats {
    /// Position of the page in the arena.
    pub index: usize,
    /// Counters of the page.
    pub usage: Usage,
    /// Largest free payload in the page.
    pub largest_free_block: usize,
}

/// Snapshot of a whole allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    /// Pages mapped.
    pub pages: usize,
    /// Bytes reserved from the kernel.
    pub capacity: usize,
    /// Counters summed over every page.
    pub usage: Usage,
    /// Largest free payload in any page.
    pub largest_free_block: usize,
}

impl AllocatorStats {
    /// Share of free bytes that sit outside the largest free block, in `[0, 1]`.
    ///
    /// Zero means all free memory is one block.
    pub fn fragmentation(&self) -> f64 {
        if self.usage.free_bytes == 0 {
            return 0.0;
        }

        1.0 - self.largest_free_block as f64 / self.usage.free_bytes as f64
    }
}

/// Position and payload size of a free block inside its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreeBlock {
    /// Offset of the block header from the page base.
    pub offset: usize,
    /// Payload bytes.
    pub size: usize,
}

/// Outcome of a defragmentation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DefragReport {
    /// Pages whose free list was sorted and coalesced.
    pub pages_visited: usize,
    /// Pairs of adjacent free blocks merged.
    pub merges: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_moves_keep_total() {
        let mut usage = Usage {
            free_bytes: 1000,
            overhead_bytes: 32,
            free_blocks: 1,
            ..Usage::default()
        };

        usage.take_split(200, 16);
        assert_eq!(usage.total(), 1032);
        assert_eq!(usage.free_blocks, 1);

        usage.give_back(200);
        assert_eq!(usage.total(), 1032);
        assert_eq!(usage.free_blocks, 2);

        usage.merge(16);
        assert_eq!(usage.total(), 1032);
        assert_eq!(usage.free_bytes, 1000);
        assert_eq!(usage.free_blocks, 1);
    }

    #[test]
    fn fragmentation_of_single_free_block_is_zero() {
        let stats = AllocatorStats {
            pages: 1,
            capacity: 8192,
            usage: Usage {
                free_bytes: 4096,
                ..Usage::default()
            },
            largest_free_block: 4096,
        };

        assert_eq!(stats.fragmentation(), 0.0);
    }
}
