//! This file contains the helper functions for the allocators.
//! These are functions that don't particularly belong to any concrete module of the program.

/// Largest alignment a caller may request.
pub const MAX_ALIGNMENT: usize = 128;

/// Granule every block payload is rounded to, so in-page headers stay word aligned.
pub(crate) const GRANULE: usize = std::mem::size_of::<usize>();

/// It aligns `to_be_aligned` using `alignment`, which must be a power of two.
///
/// Block payloads are rounded to [`GRANULE`] with it, and stack cursors are
/// moved forward to the alignment a caller asked for.
#[inline]
pub fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Bytes to skip forward from `addr` to reach the next multiple of `alignment`.
#[inline]
pub fn align_adjustment(addr: usize, alignment: usize) -> usize {
    align(addr, alignment) - addr
}

/// Whether `alignment` is accepted by the allocators: a power of two in `[1, 128]`.
#[inline]
pub fn is_valid_alignment(alignment: usize) -> bool {
    alignment.is_power_of_two() && alignment <= MAX_ALIGNMENT
}
