//! N-dimensional arrays.
//!
//! An [`NDArray`] combines an [`ArrayData`] buffer with a shape, strides and the
//! [`BackendTag`] of the handler that created it. Traced arrays additionally carry a
//! [`Trace`] node; every structural operation applied to a traced array is mirrored onto
//! its trace in the same call, so the value side and the graph side always agree on the
//! shape.
//!
//! Structural operations never copy data when the result can be expressed as new strides
//! over the same storage:
//!
//! | operation | storage |
//! |---|---|
//! | `permute`, `transpose` | always shared |
//! | `slice` | always shared (a view over the covered flat range) |
//! | `reshape`, `flatten` | shared when the array is row-major contiguous, copied otherwise |
//! | `deep_copy` | always copied |
//!
//! Arrays are created through a [`ComputationHandler`](crate::handler::ComputationHandler).
//!
//! # Example
//!
//! ```rust
//! use sigma_core::handler::{ComputationHandler, CpuHandler};
//!
//! let handler = CpuHandler::float64();
//! let a = handler.create_from(&[2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
//!
//! let t = a.transpose().unwrap();
//! assert_eq!(t.shape(), &[3, 2]);
//! assert_eq!(t.get_value::<f64>(&[2, 1]).unwrap(), 5.0);
//!
//! let s = a.slice(&[0, 1], &[2, 3]).unwrap();
//! assert_eq!(s.get_data_as::<u8>().unwrap(), vec![1, 2, 4, 5]);
//! ```

use crate::backend::BackendTag;
use crate::buffer::{ArrayData, Location};
use crate::dtype::{DataType, Scalar};
use crate::error::{Error, Result};
use crate::shape;
use crate::trace::Trace;

/// An n-dimensional array.
///
/// Cloning produces another handle to the same storage (and the same trace node); use
/// [`NDArray::deep_copy`] for an independent duplicate.
#[derive(Debug, Clone)]
pub struct NDArray {
    data: ArrayData,
    shape: Vec<usize>,
    strides: Vec<usize>,
    backend: BackendTag,
    trace: Option<Trace>,
}

impl NDArray {
    /// Wraps contiguous `data` with row-major strides.
    pub(crate) fn from_data(data: ArrayData, shape: Vec<usize>, backend: BackendTag) -> Result<Self> {
        shape::check_shape(&shape)?;
        if data.len() != shape::product(&shape) {
            return Err(Error::ShapeMismatch {
                left: shape,
                right: vec![data.len()],
                context: "buffer length does not match shape",
            });
        }
        let strides = shape::strides_for(&shape);
        Ok(Self {
            data,
            shape,
            strides,
            backend,
            trace: None,
        })
    }

    pub(crate) fn with_trace(mut self, trace: Trace) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements, always `product(shape)`.
    pub fn length(&self) -> usize {
        shape::product(&self.shape)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn element_stride(&self) -> usize {
        self.data.element_stride()
    }

    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    /// Tag of the handler instance that created this array.
    pub fn backend_tag(&self) -> BackendTag {
        self.backend
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn trace(&self) -> Option<&Trace> {
        self.trace.as_ref()
    }

    pub fn is_traced(&self) -> bool {
        self.trace.is_some()
    }

    /// Shape `[1]`.
    pub fn is_scalar(&self) -> bool {
        self.shape == [1]
    }

    pub fn is_vector(&self) -> bool {
        self.rank() == 1
    }

    pub fn is_matrix(&self) -> bool {
        self.rank() == 2
    }

    /// Whether the strides are the row-major layout of the shape.
    pub fn is_contiguous(&self) -> bool {
        shape::is_row_major(&self.shape, &self.strides)
    }

    /// Storage location of the buffer.
    ///
    /// # Errors
    ///
    /// `IndexOutOfRange` once the array was released.
    pub fn location(&self) -> Result<Location> {
        self.data.location().ok_or_else(|| Error::IndexOutOfRange {
            index: Vec::new(),
            bounds: self.shape.clone(),
        })
    }

    /// Reads the element at `indices` converted to `T`.
    ///
    /// # Errors
    ///
    /// `IndexOutOfRange` when `indices` lies outside the shape, `TypeConversionError` when
    /// the value cannot be represented as `T`.
    pub fn get_value<T: Scalar>(&self, indices: &[usize]) -> Result<T> {
        let flat = shape::flat_index(&self.shape, &self.strides, indices)?;
        T::try_from_f64(self.data.get_f64(flat)?)
    }

    /// Writes `value` converted to the element type at `indices`.
    pub fn set_value<T: Scalar>(&mut self, value: T, indices: &[usize]) -> Result<()> {
        let flat = shape::flat_index(&self.shape, &self.strides, indices)?;
        self.data.set_f64(flat, value.into_f64())
    }

    /// Buffer offsets of every element in row-major logical order.
    pub(crate) fn logical_offsets(&self) -> Vec<usize> {
        shape::strided_offsets(&self.shape, &self.strides, 0)
    }

    /// Every element in row-major logical order, widened to `f64`.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        self.data.gather_f64(&self.logical_offsets())
    }

    /// Every element in row-major logical order, converted to `T`.
    pub fn get_data_as<T: Scalar>(&self) -> Result<Vec<T>> {
        self.to_f64_vec()?.into_iter().map(T::try_from_f64).collect()
    }

    /// Copies the logical contents into fresh contiguous storage at the same location.
    fn materialise(&self) -> Result<ArrayData> {
        ArrayData::from_f64(self.data_type(), &self.to_f64_vec()?, &self.location()?)
    }

    fn check_reshape(&self, new_shape: &[usize]) -> Result<()> {
        shape::check_shape(new_shape)?;
        if shape::product(new_shape) != self.length() {
            return Err(Error::ShapeMismatch {
                left: self.shape.clone(),
                right: new_shape.to_vec(),
                context: "reshape must preserve the number of elements",
            });
        }
        Ok(())
    }

    fn reshaped(&self, new_shape: &[usize], flatten: bool) -> Result<Self> {
        self.check_reshape(new_shape)?;
        let data = if self.is_contiguous() {
            self.data.clone()
        } else {
            self.materialise()?
        };
        Ok(Self {
            data,
            shape: new_shape.to_vec(),
            strides: shape::strides_for(new_shape),
            backend: self.backend,
            trace: self.trace.as_ref().map(|t| t.reshape(new_shape, flatten)),
        })
    }

    /// A reshaped array, sharing storage when this array is contiguous.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when `product(new_shape) != length()`, `InvalidShape` when
    /// `new_shape` is empty or contains a zero.
    pub fn reshape(&self, new_shape: &[usize]) -> Result<Self> {
        self.reshaped(new_shape, false)
    }

    /// Reshapes this array (and its trace) in place.
    pub fn reshape_in_place(&mut self, new_shape: &[usize]) -> Result<()> {
        *self = self.reshaped(new_shape, false)?;
        Ok(())
    }

    /// Collapses to shape `[length]`.
    pub fn flatten(&self) -> Result<Self> {
        self.reshaped(&[self.length()], true)
    }

    pub fn flatten_in_place(&mut self) -> Result<()> {
        *self = self.flatten()?;
        Ok(())
    }

    fn permuted(&self, dims: &[usize]) -> Result<Self> {
        shape::check_permutation(dims, self.rank())?;
        Ok(Self {
            data: self.data.clone(),
            shape: shape::permuted(&self.shape, dims),
            strides: shape::permuted(&self.strides, dims),
            backend: self.backend,
            trace: self.trace.as_ref().map(|t| t.permute(dims)),
        })
    }

    /// Reorders the dimensions so that dimension `i` of the result is `dims[i]` of this
    /// array. Never copies.
    ///
    /// # Errors
    ///
    /// `InvalidPermutation` unless `dims` is a permutation of `[0, rank)`.
    pub fn permute(&self, dims: &[usize]) -> Result<Self> {
        self.permuted(dims)
    }

    pub fn permute_in_place(&mut self, dims: &[usize]) -> Result<()> {
        *self = self.permuted(dims)?;
        Ok(())
    }

    fn reversed_dims(&self) -> Vec<usize> {
        (0..self.rank()).rev().collect()
    }

    /// Reverses all dimensions.
    pub fn transpose(&self) -> Result<Self> {
        self.permuted(&self.reversed_dims())
    }

    pub fn transpose_in_place(&mut self) -> Result<()> {
        *self = self.transpose()?;
        Ok(())
    }

    /// The region `[begin, end)` as a view sharing this array's storage.
    ///
    /// The view covers the flat buffer range from `begin` to `end - 1` inclusive and keeps
    /// this array's strides, so element `i` of the slice is element `begin + i` here.
    ///
    /// # Errors
    ///
    /// `InvalidRange` when some `begin[d] >= end[d]`, `end[d] > shape[d]`, or the ranks
    /// disagree.
    pub fn slice(&self, begin: &[usize], end: &[usize]) -> Result<Self> {
        let new_shape = shape::sliced_shape(&self.shape, begin, end)?;
        let last: Vec<usize> = end.iter().map(|e| e - 1).collect();
        let first = shape::flat_index(&self.shape, &self.strides, begin)?;
        let last = shape::flat_index(&self.shape, &self.strides, &last)?;

        Ok(Self {
            data: self.data.view(first, last - first + 1)?,
            shape: new_shape,
            strides: self.strides.clone(),
            backend: self.backend,
            trace: self.trace.as_ref().map(|t| t.slice(begin, end)),
        })
    }

    /// An independent, contiguous duplicate on the same backend.
    ///
    /// A traced array gets a fresh leaf trace: gradients of the copy do not flow back into
    /// the original's graph.
    pub fn deep_copy(&self) -> Result<Self> {
        Ok(Self {
            data: self.materialise()?,
            shape: self.shape.clone(),
            strides: shape::strides_for(&self.shape),
            backend: self.backend,
            trace: self.trace.as_ref().map(|_| Trace::leaf(&self.shape)),
        })
    }

    /// Drops this array's reference to its storage. Idempotent.
    ///
    /// Views taken earlier keep the storage alive.
    pub fn release(&mut self) {
        self.data.release();
    }

    pub fn is_released(&self) -> bool {
        self.data.is_released()
    }
}
