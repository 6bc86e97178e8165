//! Shape and stride engine.
//!
//! Pure functions shared by every other component: stride derivation, flat/multi index
//! conversion, shape validation, slicing bounds, permutations and broadcasting.
//!
//! All layouts are row-major (the last dimension varies fastest). Functions work for any
//! rank, including rank 0 (empty shape, one element), even though arrays themselves are
//! created with rank >= 1 (see [`check_shape`]).
//!
//! # Example
//!
//! ```rust
//! use sigma_core::shape;
//!
//! let dims = [2, 3, 4];
//! let strides = shape::strides_for(&dims);
//! assert_eq!(strides, vec![12, 4, 1]);
//!
//! let flat = shape::flat_index(&dims, &strides, &[1, 2, 3]).unwrap();
//! assert_eq!(flat, 23);
//! assert_eq!(shape::multi_index(flat, &dims, &strides).unwrap(), vec![1, 2, 3]);
//! ```

use crate::error::{Error, Result};

/// Total number of elements described by `shape` (1 for rank 0).
pub fn product(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major strides for `shape`.
pub fn strides_for(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// Validates a shape an array can be created with.
///
/// The shape must have at least one dimension and no dimension may be zero. A scalar is
/// expressed as `[1]`.
pub fn check_shape(shape: &[usize]) -> Result<()> {
    if shape.is_empty() || shape.contains(&0) {
        return Err(Error::InvalidShape {
            shape: shape.to_vec(),
        });
    }
    Ok(())
}

/// Checks that `indices` addresses an element inside `shape`.
pub fn check_indices(shape: &[usize], indices: &[usize]) -> Result<()> {
    if indices.len() != shape.len() || indices.iter().zip(shape).any(|(&i, &n)| i >= n) {
        return Err(Error::IndexOutOfRange {
            index: indices.to_vec(),
            bounds: shape.to_vec(),
        });
    }
    Ok(())
}

/// Flat buffer offset of `indices` under `strides`.
pub fn flat_index(shape: &[usize], strides: &[usize], indices: &[usize]) -> Result<usize> {
    check_indices(shape, indices)?;
    Ok(indices.iter().zip(strides).map(|(i, s)| i * s).sum())
}

/// Inverse of [`flat_index`] for dense layouts (row-major or any permutation of it).
///
/// Dimensions are peeled off in order of decreasing stride, so permuted strides decode
/// correctly. Offsets that no multi-index maps to fail with `IndexOutOfRange`.
pub fn multi_index(flat: usize, shape: &[usize], strides: &[usize]) -> Result<Vec<usize>> {
    let out_of_range = || Error::IndexOutOfRange {
        index: vec![flat],
        bounds: shape.to_vec(),
    };
    if strides.len() != shape.len() {
        return Err(out_of_range());
    }

    let mut order: Vec<usize> = (0..shape.len()).filter(|&d| shape[d] > 1).collect();
    order.sort_by(|&a, &b| strides[b].cmp(&strides[a]));

    let mut indices = vec![0; shape.len()];
    let mut remainder = flat;
    for d in order {
        let stride = strides[d].max(1);
        indices[d] = remainder / stride;
        remainder %= stride;
        if indices[d] >= shape[d] {
            return Err(out_of_range());
        }
    }
    if remainder != 0 {
        return Err(out_of_range());
    }
    Ok(indices)
}

/// Shape of the region `[begin, end)` of `shape`.
pub fn sliced_shape(shape: &[usize], begin: &[usize], end: &[usize]) -> Result<Vec<usize>> {
    let valid = begin.len() == shape.len()
        && end.len() == shape.len()
        && (0..shape.len()).all(|d| begin[d] < end[d] && end[d] <= shape[d]);
    if !valid {
        return Err(Error::InvalidRange {
            begin: begin.to_vec(),
            end: end.to_vec(),
            shape: shape.to_vec(),
        });
    }
    Ok(begin.iter().zip(end).map(|(b, e)| e - b).collect())
}

/// Fails with `InvalidPermutation` unless `dims` is a permutation of `[0, rank)`.
pub fn check_permutation(dims: &[usize], rank: usize) -> Result<()> {
    let mut seen = vec![false; rank];
    let valid = dims.len() == rank
        && dims
            .iter()
            .all(|&d| d < rank && !std::mem::replace(&mut seen[d], true));
    if !valid {
        return Err(Error::InvalidPermutation {
            dims: dims.to_vec(),
            rank,
        });
    }
    Ok(())
}

/// The permutation undoing `dims`.
pub fn inverse_permutation(dims: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; dims.len()];
    for (i, &d) in dims.iter().enumerate() {
        inverse[d] = i;
    }
    inverse
}

/// Rearranges `values` so that entry `i` of the result is `values[dims[i]]`.
pub fn permuted(values: &[usize], dims: &[usize]) -> Vec<usize> {
    dims.iter().map(|&d| values[d]).collect()
}

/// Whether `strides` is the row-major layout of `shape`.
///
/// Dimensions of size 1 are ignored since their stride is never used.
pub fn is_row_major(shape: &[usize], strides: &[usize]) -> bool {
    let expected = strides_for(shape);
    (0..shape.len()).all(|d| shape[d] == 1 || strides[d] == expected[d])
}

/// Broadcast shape of two operands (trailing dimensions aligned, size 1 stretches).
pub fn broadcast_shapes(left: &[usize], right: &[usize]) -> Result<Vec<usize>> {
    let rank = left.len().max(right.len());
    let dim = |shape: &[usize], d: usize| {
        let pad = rank - shape.len();
        if d < pad { 1 } else { shape[d - pad] }
    };

    (0..rank)
        .map(|d| match (dim(left, d), dim(right, d)) {
            (a, b) if a == b => Ok(a),
            (1, b) => Ok(b),
            (a, 1) => Ok(a),
            _ => Err(Error::ShapeMismatch {
                left: left.to_vec(),
                right: right.to_vec(),
                context: "operands are not broadcast-compatible",
            }),
        })
        .collect()
}

/// Row-major strides of `shape` viewed through the broadcast shape `target`.
///
/// Stretched and missing leading dimensions get stride 0.
pub fn broadcast_strides(shape: &[usize], target: &[usize]) -> Vec<usize> {
    let own = strides_for(shape);
    let pad = target.len() - shape.len();
    (0..target.len())
        .map(|d| {
            if d < pad || shape[d - pad] == 1 {
                0
            } else {
                own[d - pad]
            }
        })
        .collect()
}

/// Buffer offsets of every element of `shape` in row-major logical order.
///
/// `base` is added to each offset. This is the gather map used to materialise strided
/// views and broadcast operands.
pub fn strided_offsets(shape: &[usize], strides: &[usize], base: usize) -> Vec<usize> {
    let total = product(shape);
    let mut offsets = Vec::with_capacity(total);
    if total == 0 {
        return offsets;
    }

    let mut index = vec![0; shape.len()];
    let mut offset = base;
    for _ in 0..total {
        offsets.push(offset);
        for d in (0..shape.len()).rev() {
            index[d] += 1;
            offset += strides[d];
            if index[d] < shape[d] {
                break;
            }
            offset -= strides[d] * shape[d];
            index[d] = 0;
        }
    }
    offsets
}
