//! Errors reported by the allocators.

use thiserror::Error;

/// Result type used across the crate.
pub type AllocResult<T> = Result<T, AllocError>;

/// Everything that can go wrong while allocating, releasing or inspecting memory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The OS refused to map another page, or the configured page cap was hit.
    #[error("out of memory: requested {requested} bytes with {pages} pages mapped")]
    OutOfMemory {
        /// Bytes requested by the failing call.
        requested: usize,
        /// Pages owned by the allocator at the time of the failure.
        pages: usize,
    },

    /// Alignment is not a power of two in `[1, 128]`.
    #[error("invalid alignment {0}: must be a power of two between 1 and 128")]
    InvalidAlignment(usize),

    /// The request can never fit inside a single page.
    #[error("request of {requested} bytes aligned to {alignment} exceeds the page limit of {max} bytes")]
    RequestTooLarge {
        /// Bytes requested.
        requested: usize,
        /// Alignment requested.
        alignment: usize,
        /// Largest payload a page can hold.
        max: usize,
    },

    /// The handle refers to a block that was already released.
    #[error("stale handle: slot {slot} generation {generation}")]
    StaleHandle {
        /// Slot index carried by the handle.
        slot: u32,
        /// Generation carried by the handle.
        generation: u32,
    },

    /// A stack allocator ran out of room.
    #[error("stack overflow: requested {requested} bytes, {remaining} remaining")]
    StackOverflow {
        /// Bytes requested, including alignment padding.
        requested: usize,
        /// Bytes left between the cursor and the end of the stack.
        remaining: usize,
    },

    /// A marker points past the current stack cursor.
    #[error("invalid marker {marker}: cursor is at {cursor}")]
    InvalidMarker {
        /// Offset recorded in the marker.
        marker: usize,
        /// Current cursor offset.
        cursor: usize,
    },

    /// Bookkeeping and page contents disagree.
    #[error("page {page} corrupted: {reason}")]
    Corrupted {
        /// Index of the offending page.
        page: usize,
        /// What the integrity check found.
        reason: String,
    },

    /// Arena wide counters no longer match the sum of the pages.
    #[error("arena totals drifted: {0}")]
    TotalsDrifted(String),

    /// Configuration could not be parsed or is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
