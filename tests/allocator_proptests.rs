//! Property-based tests for the block allocator.
//!
//! Random sequences of allocations, reference count changes, reallocations
//! and defragmentation steps are replayed against a [`BlockAllocator`] while a
//! simple model tracks what every live block must contain.

use pagealloc::{ALL_PAGES, BlockAllocator, BlockHandle, PAGE_FREE_SIZE, PAGE_SIZE};
use proptest::prelude::*;

// ============================================================================
//  Strategies
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Alloc { size: usize, alignment: usize },
    Retain(usize),
    Release(usize),
    Realloc(usize, usize),
    Defragment(usize),
}

fn alignment() -> impl Strategy<Value = usize> {
    (0u32..=7).prop_map(|shift| 1usize << shift)
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            5 => (0usize..=2048, alignment()).prop_map(|(size, alignment)| Op::Alloc { size, alignment }),
            1 => any::<usize>().prop_map(Op::Retain),
            4 => any::<usize>().prop_map(Op::Release),
            1 => (any::<usize>(), 1usize..=1024).prop_map(|(pick, size)| Op::Realloc(pick, size)),
            1 => prop_oneof![Just(1usize), Just(2), Just(ALL_PAGES)].prop_map(Op::Defragment),
        ],
        0..=max_ops,
    )
}

// ============================================================================
//  Model
// ============================================================================

struct Live {
    handle: BlockHandle,
    size: usize,
    alignment: usize,
    refs: u32,
    fill: u8,
}

fn fill(allocator: &mut BlockAllocator, live: &Live) {
    allocator.bytes_mut(live.handle).unwrap().fill(live.fill);
}

fn check(allocator: &BlockAllocator, blocks: &[Live]) -> Result<(), TestCaseError> {
    prop_assert!(allocator.verify().is_ok(), "{:?}", allocator.verify());

    for live in blocks {
        let bytes = allocator.bytes(live.handle).unwrap();
        prop_assert_eq!(bytes.len(), live.size);
        prop_assert!(bytes.iter().all(|b| *b == live.fill));

        let addr = allocator.as_ptr(live.handle).unwrap().as_ptr() as usize;
        prop_assert_eq!(addr % live.alignment, 0);
    }

    let expected_used: usize = blocks.iter().map(|live| live.size).sum();
    prop_assert!(allocator.used() >= expected_used);

    for index in 0..allocator.page_count() {
        prop_assert_eq!(allocator.page_stats(index).unwrap().usage.total(), PAGE_SIZE);
    }

    Ok(())
}

// ============================================================================
//  Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Bookkeeping stays consistent and no block ever overwrites another.
    #[test]
    fn random_workload_keeps_invariants(ops in operations(200)) {
        let mut allocator = BlockAllocator::new();
        let mut blocks: Vec<Live> = Vec::new();
        let mut next_fill = 1u8;

        for op in ops {
            match op {
                Op::Alloc { size, alignment } => {
                    let handle = allocator.alloc(size, alignment).unwrap();
                    prop_assert!(allocator.bytes(handle).unwrap().iter().all(|b| *b == 0));

                    let live = Live { handle, size, alignment, refs: 1, fill: next_fill };
                    next_fill = next_fill.wrapping_add(1).max(1);
                    fill(&mut allocator, &live);
                    blocks.push(live);
                }
                Op::Retain(pick) if !blocks.is_empty() => {
                    let index = pick % blocks.len();
                    let live = &mut blocks[index];
                    live.refs += 1;
                    prop_assert_eq!(allocator.retain(live.handle), Ok(live.refs));
                }
                Op::Release(pick) if !blocks.is_empty() => {
                    let index = pick % blocks.len();
                    let live = &mut blocks[index];
                    live.refs -= 1;
                    prop_assert_eq!(allocator.release(live.handle), Ok(live.refs));

                    if live.refs == 0 {
                        let gone = blocks.swap_remove(index);
                        prop_assert!(!allocator.is_live(gone.handle));
                    }
                }
                Op::Realloc(pick, new_size) if !blocks.is_empty() => {
                    let index = pick % blocks.len();
                    if blocks[index].refs != 1 {
                        continue;
                    }

                    let live = &mut blocks[index];
                    let old = live.handle;
                    allocator.realloc(&mut live.handle, live.size, new_size).unwrap();
                    prop_assert!(!allocator.is_live(old));

                    let kept = live.size.min(new_size);
                    let bytes = allocator.bytes(live.handle).unwrap();
                    prop_assert!(bytes[..kept].iter().all(|b| *b == live.fill));
                    prop_assert!(bytes[kept..].iter().all(|b| *b == 0));

                    live.size = new_size;
                    let live = &blocks[index];
                    fill(&mut allocator, live);
                }
                Op::Defragment(pages) => {
                    allocator.defragment(pages);
                }
                _ => {}
            }

            check(&allocator, &blocks)?;
        }

        for live in blocks.drain(..) {
            allocator.dealloc(live.handle).unwrap();
        }
        prop_assert_eq!(allocator.used(), 0);

        allocator.defragment(ALL_PAGES);
        let stats = allocator.stats();
        prop_assert_eq!(stats.usage.free_blocks, stats.pages);
        for index in 0..stats.pages {
            prop_assert_eq!(allocator.page_stats(index).unwrap().largest_free_block, PAGE_FREE_SIZE);
        }
        allocator.verify().unwrap();
    }

    /// A second full defragmentation never finds anything left to merge.
    #[test]
    fn defragment_is_idempotent(
        sizes in prop::collection::vec(0usize..=512, 1..=128),
        keep in prop::collection::vec(any::<bool>(), 128),
    ) {
        let mut allocator = BlockAllocator::new();
        let handles: Vec<_> = sizes
            .iter()
            .map(|&size| allocator.alloc(size, 8).unwrap())
            .collect();

        for (handle, keep) in handles.into_iter().zip(keep) {
            if !keep {
                allocator.release(handle).unwrap();
            }
        }

        allocator.defragment(ALL_PAGES);
        let before: Vec<_> = (0..allocator.page_count())
            .map(|index| allocator.free_blocks(index).unwrap())
            .collect();

        prop_assert_eq!(allocator.defragment(ALL_PAGES).merges, 0);
        let after: Vec<_> = (0..allocator.page_count())
            .map(|index| allocator.free_blocks(index).unwrap())
            .collect();
        prop_assert_eq!(before, after);
        allocator.verify().unwrap();
    }
}
