//! End to end scenarios for the block and stack allocators.

use pagealloc::{
    ALL_PAGES, AllocError, Allocator, AllocatorConfig, BLOCK_HEADER_SIZE, BlockAllocator,
    FreeBlock, PAGE_FREE_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE, StackAllocator,
};

fn free_lists(allocator: &BlockAllocator) -> Vec<Vec<FreeBlock>> {
    (0..allocator.page_count())
        .map(|index| allocator.free_blocks(index).unwrap())
        .collect()
}

fn assert_pages_add_up(allocator: &BlockAllocator) {
    for index in 0..allocator.page_count() {
        let stats = allocator.page_stats(index).unwrap();
        assert_eq!(stats.usage.total(), PAGE_SIZE, "page {index}");
    }
}

#[test]
fn page_counters_always_add_up() {
    let mut allocator = BlockAllocator::new();
    let mut handles = Vec::new();

    for i in 0..200 {
        handles.push(allocator.alloc(8 + (i * 37) % 700, 1 << (i % 8)).unwrap());
        assert_pages_add_up(&allocator);
    }

    for handle in handles.drain(..).step_by(3) {
        allocator.release(handle).unwrap();
    }
    assert_pages_add_up(&allocator);

    allocator.defragment(ALL_PAGES);
    assert_pages_add_up(&allocator);
    allocator.verify().unwrap();
}

#[test]
fn every_alignment_is_honoured() {
    let mut allocator = BlockAllocator::new();

    for shift in 0..=7 {
        let alignment = 1usize << shift;
        for size in [0, 1, 7, 24, 100, 1000] {
            let handle = allocator.alloc(size, alignment).unwrap();
            let addr = allocator.as_ptr(handle).unwrap().as_ptr() as usize;

            assert_eq!(addr % alignment, 0, "size {size} alignment {alignment}");
        }
    }

    allocator.verify().unwrap();
}

#[test]
fn reference_counting() {
    let mut allocator = BlockAllocator::new();
    let handle = allocator.alloc(48, 8).unwrap();

    assert_eq!(allocator.ref_count(handle), Ok(1));
    assert_eq!(allocator.retain(handle), Ok(2));
    assert_eq!(allocator.release(handle), Ok(1));
    assert!(allocator.is_live(handle));

    assert_eq!(allocator.release(handle), Ok(0));
    assert!(!allocator.is_live(handle));
    assert_eq!(allocator.used(), 0);
    assert!(matches!(
        allocator.retain(handle),
        Err(AllocError::StaleHandle { .. })
    ));
}

#[test]
fn freed_neighbours_are_coalesced_by_defragment() {
    let mut allocator = BlockAllocator::new();

    let a = allocator.alloc(32, 8).unwrap();
    let b = allocator.alloc(32, 8).unwrap();
    let c = allocator.alloc(32, 8).unwrap();
    let _d = allocator.alloc(32, 8).unwrap();

    allocator.release(a).unwrap();
    allocator.release(c).unwrap();
    // `b` merges with `c`, the list head, but not with `a`.
    allocator.release(b).unwrap();
    assert_eq!(allocator.stats().usage.free_blocks, 3);

    let report = allocator.defragment(ALL_PAGES);

    assert_eq!(report.pages_visited, 1);
    assert_eq!(report.merges, 1);
    let free = allocator.free_blocks(0).unwrap();
    assert_eq!(
        free[0],
        FreeBlock {
            offset: PAGE_HEADER_SIZE,
            size: 3 * 32 + 2 * BLOCK_HEADER_SIZE,
        }
    );
    assert_eq!(free.len(), 2);
    allocator.verify().unwrap();
}

#[test]
fn defragment_is_idempotent() {
    let mut allocator = BlockAllocator::new();
    let handles: Vec<_> = (0..64)
        .map(|i| allocator.alloc(16 + i * 8, 8).unwrap())
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        if i % 4 != 3 {
            allocator.release(handle).unwrap();
        }
    }

    allocator.defragment(ALL_PAGES);
    let once = free_lists(&allocator);

    let report = allocator.defragment(ALL_PAGES);
    assert_eq!(report.merges, 0);
    assert_eq!(free_lists(&allocator), once);

    // Sorted by address, and no two neighbours touch any more.
    for page in once {
        for pair in page.windows(2) {
            assert!(pair[0].offset + BLOCK_HEADER_SIZE + pair[0].size < pair[1].offset);
        }
    }
}

#[test]
fn incremental_steps_cover_every_page() {
    let config = AllocatorConfig::default().with_defrag_pages_per_step(2);
    let mut allocator = BlockAllocator::with_config(config).unwrap();

    // Five pages, each left with one pair of touching free blocks that
    // releasing alone does not merge.
    let mut triples = Vec::new();
    for _ in 0..5 {
        let a = allocator.alloc(1024, 8).unwrap();
        let b = allocator.alloc(1024, 8).unwrap();
        let c = allocator.alloc(1024, 8).unwrap();
        let _rest = allocator.alloc(4096, 8).unwrap();
        triples.push((a, b, c));
    }
    assert_eq!(allocator.page_count(), 5);

    for (a, b, c) in triples {
        allocator.release(a).unwrap();
        allocator.release(c).unwrap();
        allocator.release(b).unwrap();
    }

    let merges: usize = (0..3).map(|_| allocator.defragment_step().merges).sum();

    assert_eq!(merges, 5);
    assert_eq!(allocator.defragment(ALL_PAGES).merges, 0);
    allocator.verify().unwrap();
}

#[test]
fn realloc_preserves_contents() {
    let mut allocator = BlockAllocator::new();
    let mut handle = allocator.alloc(16, 8).unwrap();

    let pattern: Vec<u8> = (1..=16).collect();
    allocator.bytes_mut(handle).unwrap().copy_from_slice(&pattern);
    let old = handle;

    allocator.realloc(&mut handle, 16, 64).unwrap();

    assert!(!allocator.is_live(old));
    assert_eq!(allocator.size_of(handle), Ok(64));
    let bytes = allocator.bytes(handle).unwrap();
    assert_eq!(&bytes[..16], pattern.as_slice());
    assert!(bytes[16..].iter().all(|b| *b == 0));

    allocator.realloc(&mut handle, 64, 4).unwrap();
    assert_eq!(allocator.bytes(handle).unwrap(), &pattern[..4]);
    allocator.verify().unwrap();
}

#[test]
fn realloc_keeps_shared_block_alive() {
    let mut allocator = BlockAllocator::new();
    let original = allocator.alloc(32, 16).unwrap();
    allocator.retain(original).unwrap();

    let mut moved = original;
    allocator.realloc(&mut moved, 32, 128).unwrap();

    assert_ne!(moved, original);
    assert_eq!(allocator.ref_count(original), Ok(1));
    assert_eq!(allocator.as_ptr(moved).unwrap().as_ptr() as usize % 16, 0);
}

#[test]
fn full_page_then_new_page() {
    let mut allocator = BlockAllocator::new();

    // Leaves exactly one header worth of bytes, which is not worth a split.
    let big = allocator.alloc(PAGE_FREE_SIZE - BLOCK_HEADER_SIZE, 1).unwrap();
    assert_eq!(allocator.page_count(), 1);
    assert!(allocator.free_blocks(0).unwrap().is_empty());
    assert_eq!(allocator.used(), PAGE_FREE_SIZE);

    let small = allocator.alloc(1, 1).unwrap();
    assert_eq!(allocator.page_count(), 2);

    allocator.release(big).unwrap();
    allocator.release(small).unwrap();
    assert_eq!(allocator.used(), 0);
    allocator.verify().unwrap();
}

#[test]
fn smaller_hole_is_skipped() {
    let mut allocator = BlockAllocator::new();

    let a = allocator.alloc(16, 8).unwrap();
    let b = allocator.alloc(32, 8).unwrap();
    let c = allocator.alloc(64, 8).unwrap();
    let b_ptr = allocator.as_ptr(b).unwrap();

    allocator.release(b).unwrap();
    let d = allocator.alloc(40, 8).unwrap();

    // 40 bytes do not fit in the hole left by `b`.
    assert_ne!(allocator.as_ptr(d).unwrap(), b_ptr);
    assert!(allocator.as_ptr(d).unwrap() > allocator.as_ptr(c).unwrap());
    allocator.verify().unwrap();

    // Releasing `a` folds it into the hole, which is the list head.
    allocator.release(a).unwrap();
    assert_eq!(
        allocator.free_blocks(0).unwrap()[0],
        FreeBlock {
            offset: PAGE_HEADER_SIZE,
            size: 16 + BLOCK_HEADER_SIZE + 32,
        }
    );
    allocator.verify().unwrap();
}

#[test]
fn reset_keeping_pages() {
    let mut allocator = BlockAllocator::new();
    let handles: Vec<_> = (0..3)
        .map(|_| allocator.alloc(PAGE_FREE_SIZE, 1).unwrap())
        .collect();
    assert_eq!(allocator.page_count(), 3);

    allocator.reset(false);

    assert_eq!(allocator.page_count(), 3);
    assert_eq!(allocator.used(), 0);
    assert!(handles.iter().all(|handle| !allocator.is_live(*handle)));
    assert_eq!(allocator.stats().usage.free_bytes, 3 * PAGE_FREE_SIZE);
    allocator.verify().unwrap();

    // Recycled pages are reused before new ones are mapped.
    for _ in 0..3 {
        allocator.alloc(PAGE_FREE_SIZE, 1).unwrap();
    }
    assert_eq!(allocator.page_count(), 3);
}

#[test]
fn reset_releasing_pages() {
    let mut allocator = BlockAllocator::new();
    for _ in 0..4 {
        allocator.alloc(PAGE_FREE_SIZE, 1).unwrap();
    }

    allocator.reset(true);

    assert_eq!(allocator.page_count(), 1);
    assert_eq!(allocator.capacity(), PAGE_SIZE);
    assert_eq!(allocator.used(), 0);
    allocator.verify().unwrap();
}

#[test]
fn page_cap_is_enforced() {
    let config = AllocatorConfig::from_toml_str("max_pages = 2").unwrap();
    let mut allocator = BlockAllocator::with_config(config).unwrap();

    allocator.alloc(PAGE_FREE_SIZE, 1).unwrap();
    allocator.alloc(PAGE_FREE_SIZE, 1).unwrap();

    assert_eq!(
        allocator.alloc(8, 8),
        Err(AllocError::OutOfMemory {
            requested: 8,
            pages: 2
        })
    );
    allocator.verify().unwrap();
}

#[test]
fn stack_markers_round_trip() {
    let mut parent = BlockAllocator::new();
    let mut stack = StackAllocator::new(&mut parent, 1024, 64).unwrap();

    let bottom = stack.marker();
    stack.alloc(100, 4).unwrap();
    let middle = stack.marker();
    let used = stack.used();

    let top = stack.alloc(200, 32).unwrap();
    assert_eq!(top.as_ptr() as usize % 32, 0);

    stack.revert_to(middle).unwrap();
    assert_eq!(stack.used(), used);

    // The space above the marker is handed out again.
    assert_eq!(stack.alloc(200, 32).unwrap(), top);

    stack.revert_to(bottom).unwrap();
    assert_eq!(stack.used(), 0);
    assert_eq!(stack.remaining(), 1024);
}

#[test]
fn stack_overflow_does_not_move_cursor() {
    let mut parent = BlockAllocator::new();
    let mut stack = StackAllocator::new(&mut parent, 128, 8).unwrap();

    stack.alloc(100, 8).unwrap();

    assert!(matches!(
        stack.alloc(64, 8),
        Err(AllocError::StackOverflow { .. })
    ));
    assert_eq!(stack.used(), 100);
}

#[test]
fn stack_over_a_stack() {
    let mut parent = BlockAllocator::new();
    let mut outer = StackAllocator::new(&mut parent, 2048, 16).unwrap();

    {
        let mut inner = StackAllocator::new(&mut outer, 512, 16).unwrap();
        let ptr = Allocator::alloc(&mut inner, 64, 16).unwrap();

        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        assert_eq!(inner.used(), 64);
    }

    // The inner stack's block stays reserved until the outer one is reverted.
    assert_eq!(outer.used(), 512 + 16);
    outer.reset();
    assert_eq!(outer.used(), 0);
}
