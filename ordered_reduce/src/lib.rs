//! # ordered_reduce
//!
//! A small utility crate for parallel reductions that give the same answer on one thread
//! and on sixty-four.
//!
//! Rayon's `reduce` and `sum` split work adaptively, so the order in which floating point
//! partial sums are combined depends on how many workers happened to steal work. For long
//! single precision buffers this changes the last digits of the result, which is enough to
//! change when an iterative solver decides it has converged.
//!
//! The functions in this crate split the index range into blocks of a fixed size. Every
//! block is folded sequentially, blocks are processed in parallel, and the block results are
//! combined on the calling thread in block order. The result therefore only depends on the
//! block size, never on the thread count.
//!
//! ## Features
//!
//! - Generic block reduction with a user supplied combiner
//! - `f64` sums of an index function
//! - Dot products and sums of squares of `f32` slices accumulated in `f64`
//!
//! ## Example
//!
//! ```
//! use ordered_reduce::ordered_sum;
//!
//! let total = ordered_sum(101, 8, |i| i as f64);
//! assert_eq!(total, 5050.0);
//! ```

use rayon::prelude::*;
use std::ops::Range;

/// Block length used by the slice helpers.
pub const DEFAULT_BLOCK: usize = 16 * 1024;

/// Reduces `0..len` in fixed blocks, combining the block results in order.
///
/// `map` receives the index range of one block and folds it sequentially. The block
/// results are collected in block order and folded with `combine`, starting from `init`,
/// on the calling thread.
///
/// # Arguments
///
/// * `len` - Number of indices to reduce
/// * `block` - Block length, values of 0 are treated as 1
/// * `map` - Sequential reduction of one block
/// * `combine` - Combines the running value with the next block result
/// * `init` - Value returned for an empty range
///
/// # Examples
///
/// ```
/// use ordered_reduce::ordered_reduce;
///
/// let data = vec![3, 9, 2, 7, 5];
/// let max = ordered_reduce(
///     data.len(),
///     2,
///     |range| range.map(|i| data[i]).max().unwrap_or(i32::MIN),
///     |a, b| a.max(b),
///     i32::MIN,
/// );
/// assert_eq!(max, 9);
/// ```
pub fn ordered_reduce<R, F, C>(len: usize, block: usize, map: F, combine: C, init: R) -> R
where
    R: Send,
    F: Fn(Range<usize>) -> R + Sync + Send,
    C: Fn(R, R) -> R,
{
    let block = block.max(1);
    let n_blocks = len.div_ceil(block);
    let partials: Vec<R> = (0..n_blocks)
        .into_par_iter()
        .map(|b| {
            let start = b * block;
            map(start..(start + block).min(len))
        })
        .collect();
    partials.into_iter().fold(init, combine)
}

/// Sums `f(i)` for `i` in `0..len` in double precision.
///
/// # Examples
///
/// ```
/// use ordered_reduce::ordered_sum;
///
/// let squares = ordered_sum(4, 3, |i| (i * i) as f64);
/// assert_eq!(squares, 14.0);
/// ```
pub fn ordered_sum<F>(len: usize, block: usize, f: F) -> f64
where
    F: Fn(usize) -> f64 + Sync + Send,
{
    ordered_reduce(len, block, |range| range.map(&f).sum::<f64>(), |a, b| a + b, 0.0)
}

/// Dot product of two `f32` slices accumulated in `f64`.
///
/// Only the common prefix is used if the lengths differ.
///
/// # Examples
///
/// ```
/// use ordered_reduce::ordered_dot;
///
/// assert_eq!(ordered_dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
/// ```
pub fn ordered_dot(a: &[f32], b: &[f32]) -> f64 {
    let len = a.len().min(b.len());
    ordered_reduce(
        len,
        DEFAULT_BLOCK,
        |range| {
            range
                .map(|i| a[i] as f64 * b[i] as f64)
                .sum::<f64>()
        },
        |x, y| x + y,
        0.0,
    )
}

/// Sum of `f32` values accumulated in `f64`.
pub fn ordered_total(a: &[f32]) -> f64 {
    ordered_reduce(
        a.len(),
        DEFAULT_BLOCK,
        |range| a[range].iter().map(|&v| v as f64).sum::<f64>(),
        |x, y| x + y,
        0.0,
    )
}

/// Sum of squares of `f32` values accumulated in `f64`.
pub fn ordered_sum_squares(a: &[f32]) -> f64 {
    ordered_dot(a, a)
}
