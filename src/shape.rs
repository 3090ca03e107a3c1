//! Balanced splitting of bulk shapes.
//!
//! A shape of `n` items is split into `p` contiguous blocks with
//! `begin(i) = i * n / p` and `end(i) = (i + 1) * n / p`. Blocks differ in size
//! by at most one item, and some blocks are empty when `n < p`. Callers depend
//! on which block receives the remainder, so the boundaries must stay exactly
//! this formula.

use std::ops::Range;

/// Returns the first offset of block `index` of `parts`.
#[inline]
pub fn block_begin(index: usize, len: usize, parts: usize) -> usize {
    assert!(parts > 0, "cannot split a shape into zero blocks");
    // Widened so that `index * len` cannot overflow.
    (index as u128 * len as u128 / parts as u128) as usize
}

/// Returns the offset one past the end of block `index` of `parts`.
#[inline]
pub fn block_end(index: usize, len: usize, parts: usize) -> usize {
    block_begin(index + 1, len, parts)
}

/// Returns block `index` of `parts` of the given range.
#[inline]
pub fn block_range(shape: &Range<usize>, index: usize, parts: usize) -> Range<usize> {
    let len = shape.len();
    shape.start + block_begin(index, len, parts)..shape.start + block_end(index, len, parts)
}

/// Iterates over all `parts` blocks of a range in order.
pub fn blocks(shape: Range<usize>, parts: usize) -> impl Iterator<Item = Range<usize>> {
    (0..parts).map(move |index| block_range(&shape, index, parts))
}
