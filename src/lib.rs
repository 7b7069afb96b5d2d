//! Paged memory allocation for engine subsystems.
//!
//! [`BlockAllocator`] replaces the platform heap with fixed-size pages
//! requested straight from the kernel, carved into variable-size blocks:
//!
//! ```text
//! +----------------------------------------+      +----------------------------------------+
//! |       | +-------+ +-------+ +-------+  |      |       | +-------+ +-------+ +-------+  |
//! | Stamp | | Block | | Free  | | Block |  | ---> | Stamp | | Free  | | Block | | Free  |  |
//! |       | +-------+ +-------+ +-------+  |      |       | +-------+ +-------+ +-------+  |
//! +----------------------------------------+      +----------------------------------------+
//! ```
//!
//! * allocation is first fit, splitting the chosen block when the leftover can
//!   hold another header;
//! * blocks are reference counted and named by generation-tagged
//!   [`BlockHandle`]s, so a released block can never be reached again by mistake;
//! * coalescing of adjacent free blocks is incremental: [`BlockAllocator::defragment`]
//!   sorts and merges the free lists of a bounded number of pages per call.
//!
//! [`StackAllocator`] is a bump-pointer allocator carved from a single block
//! of any [`Allocator`], released in bulk through markers.

mod allocator;
mod block;
mod config;
mod context;
mod defrag;
mod error;
mod freelist;
mod kernel;
mod page;
mod stack;
mod stats;
mod traits;
mod utils;

pub use allocator::{ALL_PAGES, BlockAllocator};
pub use block::{BLOCK_HEADER_SIZE, BlockHandle};
pub use config::{AllocatorConfig, DEFAULT_DEFRAG_PAGES_PER_STEP};
pub use context::{SharedAllocator, with_thread_allocator};
pub use error::{AllocError, AllocResult};
pub use page::{PAGE_FREE_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE};
pub use stack::{Marker, StackAllocator};
pub use stats::{AllocatorStats, DefragReport, FreeBlock, PageStats, Usage};
pub use traits::Allocator;
pub use utils::{MAX_ALIGNMENT, align, align_adjustment, is_valid_alignment};
