//! Helper functions that don't particularly belong to any concrete module of the allocator.

/// It aligns `to_be_aligned` up to the next multiple of `alignment`, which
/// has to be a power of two.
///
/// This method is used to round region sizes up to a multiple of the page size
/// and block payloads up to a multiple of [`crate::ALIGNMENT`].
#[inline]
pub const fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Same as [`align`] but returns `None` instead of wrapping around when
/// `to_be_aligned` is close to `usize::MAX`. Caller supplied sizes go through here.
#[inline]
pub fn checked_align(to_be_aligned: usize, alignment: usize) -> Option<usize> {
    to_be_aligned
        .checked_add(alignment - 1)
        .map(|value| value & !(alignment - 1))
}
