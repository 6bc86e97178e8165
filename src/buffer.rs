//! Typed data buffers.
//!
//! A [`DataBuffer<T>`] is a window `{offset, len, element_stride}` over reference-counted
//! storage that lives either in host memory or in a device allocation. Views share the
//! storage of the buffer they were taken from; the storage (and with it any device
//! allocation) is freed when the last buffer referencing it is released or dropped.
//!
//! [`ArrayData`] is the closed set of element types an array can hold, resolved when the
//! array is created.
//!
//! # Example
//!
//! ```rust
//! use sigma_core::buffer::DataBuffer;
//!
//! let mut data = DataBuffer::from_vec(vec![1.0f32, 2.0, 3.0, 4.0]);
//! let view = data.view(1, 2).unwrap();
//! view.set(0, 20.0).unwrap();
//! assert_eq!(data.get(1).unwrap(), 20.0);
//!
//! data.release();
//! assert!(data.get(0).is_err());
//! assert_eq!(view.get(1).unwrap(), 3.0);
//! ```

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::device::{DeviceAllocation, DeviceContext};
use crate::dtype::{DataType, Element, Scalar};
use crate::error::{Error, Result};

/// Where a buffer's storage lives.
#[derive(Debug, Clone)]
pub enum Location {
    /// Host memory.
    Host,
    /// Memory of a device context.
    Device(Arc<DeviceContext>),
}

impl Location {
    fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Host, Self::Host) => true,
            (Self::Device(a), Self::Device(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Device(ctx) => write!(f, "{}", ctx.id()),
        }
    }
}

#[derive(Debug)]
enum Storage<T> {
    Host(RwLock<Vec<T>>),
    Device(DeviceAllocation),
}

impl<T: Element> Storage<T> {
    fn location(&self) -> Location {
        match self {
            Self::Host(_) => Location::Host,
            Self::Device(alloc) => Location::Device(Arc::clone(alloc.context())),
        }
    }

    /// Reads the elements at storage positions `positions`.
    fn read(&self, positions: &[usize]) -> Result<Vec<T>> {
        match self {
            Self::Host(values) => {
                let values = values.read().unwrap_or_else(PoisonError::into_inner);
                Ok(positions.iter().map(|&p| values[p]).collect())
            }
            Self::Device(alloc) => {
                let (Some(&lo), Some(&hi)) = (positions.iter().min(), positions.iter().max())
                else {
                    return Ok(Vec::new());
                };
                let mut staged = vec![T::default(); hi - lo + 1];
                alloc.read(lo * T::DATA_TYPE.size_bytes(), bytemuck::cast_slice_mut(&mut staged))?;
                Ok(positions.iter().map(|&p| staged[p - lo]).collect())
            }
        }
    }

    fn write(&self, position: usize, value: T) -> Result<()> {
        match self {
            Self::Host(values) => {
                values.write().unwrap_or_else(PoisonError::into_inner)[position] = value;
                Ok(())
            }
            Self::Device(alloc) => {
                alloc.write(position * T::DATA_TYPE.size_bytes(), bytemuck::bytes_of(&value))
            }
        }
    }
}

/// Little-endian record encoding of `values`.
fn encode_le<T: Element>(values: &[T]) -> Vec<u8> {
    let size = T::DATA_TYPE.size_bytes();
    let mut raw = vec![0; values.len() * size];
    for (chunk, &value) in raw.chunks_exact_mut(size).zip(values) {
        value.write_le(chunk);
    }
    raw
}

/// A strided window over shared element storage.
#[derive(Debug)]
pub struct DataBuffer<T> {
    storage: Option<Arc<Storage<T>>>,
    offset: usize,
    len: usize,
    element_stride: usize,
}

impl<T: Element> DataBuffer<T> {
    /// Allocates `len` zeroed host elements.
    pub fn allocate(len: usize) -> Self {
        Self::from_vec(vec![T::default(); len])
    }

    /// Wraps `values` as a contiguous host buffer.
    pub fn from_vec(values: Vec<T>) -> Self {
        let len = values.len();
        Self {
            storage: Some(Arc::new(Storage::Host(RwLock::new(values)))),
            offset: 0,
            len,
            element_stride: 1,
        }
    }

    /// Allocates `len` zeroed elements at `location`.
    ///
    /// # Errors
    ///
    /// Device allocations fail with `ContextNotBound` unless the context is bound to the
    /// calling thread.
    pub fn allocate_in(location: &Location, len: usize) -> Result<Self> {
        match location {
            Location::Host => Ok(Self::allocate(len)),
            Location::Device(ctx) => {
                let alloc = ctx.allocate(len * T::DATA_TYPE.size_bytes())?;
                Ok(Self::from_storage(Storage::Device(alloc), len))
            }
        }
    }

    /// Uploads `values` to `location` as a contiguous buffer.
    pub fn from_vec_in(location: &Location, values: Vec<T>) -> Result<Self> {
        match location {
            Location::Host => Ok(Self::from_vec(values)),
            Location::Device(ctx) => {
                let raw: &[u8] = bytemuck::cast_slice(&values);
                let alloc = ctx.allocate(raw.len())?;
                alloc.write(0, raw)?;
                Ok(Self::from_storage(Storage::Device(alloc), values.len()))
            }
        }
    }

    fn from_storage(storage: Storage<T>, len: usize) -> Self {
        Self {
            storage: Some(Arc::new(storage)),
            offset: 0,
            len,
            element_stride: 1,
        }
    }

    /// Number of addressable elements.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer addresses no elements.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset multiplier between consecutive elements in the storage.
    pub const fn element_stride(&self) -> usize {
        self.element_stride
    }

    /// Whether [`release`](Self::release) was called on this buffer.
    pub const fn is_released(&self) -> bool {
        self.storage.is_none()
    }

    /// Where the storage lives, `None` once released.
    pub fn location(&self) -> Option<Location> {
        self.storage.as_ref().map(|s| s.location())
    }

    /// Whether `other` shares this buffer's storage.
    pub fn shares_storage(&self, other: &Self) -> bool {
        match (&self.storage, &other.storage) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn storage(&self, index: usize) -> Result<&Storage<T>> {
        match &self.storage {
            Some(storage) if index < self.len => Ok(storage),
            _ => Err(Error::IndexOutOfRange {
                index: vec![index],
                bounds: vec![if self.storage.is_some() { self.len } else { 0 }],
            }),
        }
    }

    const fn position(&self, index: usize) -> usize {
        self.offset + index * self.element_stride
    }

    /// Reads element `index`.
    ///
    /// # Errors
    ///
    /// `IndexOutOfRange` when `index >= len()` or the buffer was released.
    pub fn get(&self, index: usize) -> Result<T> {
        let storage = self.storage(index)?;
        let values = storage.read(&[self.position(index)])?;
        Ok(values[0])
    }

    /// Writes element `index`. Writes are visible through every view of the storage.
    pub fn set(&self, index: usize, value: T) -> Result<()> {
        self.storage(index)?.write(self.position(index), value)
    }

    /// Reads the elements at buffer indices `indices`, in order.
    pub fn gather(&self, indices: &[usize]) -> Result<Vec<T>> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        let max = indices.iter().copied().max().unwrap_or_default();
        let storage = self.storage(max)?;
        let positions: Vec<usize> = indices.iter().map(|&i| self.position(i)).collect();
        storage.read(&positions)
    }

    /// Every element in index order.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let indices: Vec<usize> = (0..self.len).collect();
        self.gather(&indices)
    }

    /// A zero-copy view of `len` elements starting at `start`.
    ///
    /// # Errors
    ///
    /// `InvalidRange` when `[start, start + len)` is not inside this buffer.
    pub fn view(&self, start: usize, len: usize) -> Result<Self> {
        let storage = match &self.storage {
            Some(storage) if start.checked_add(len).is_some_and(|end| end <= self.len) => {
                Arc::clone(storage)
            }
            _ => {
                return Err(Error::InvalidRange {
                    begin: vec![start],
                    end: vec![start.saturating_add(len)],
                    shape: vec![self.len],
                });
            }
        };
        Ok(Self {
            storage: Some(storage),
            offset: self.position(start),
            len,
            element_stride: self.element_stride,
        })
    }

    /// A deep copy into fresh contiguous storage at the same location.
    pub fn copy(&self) -> Result<Self> {
        let location = self.location().ok_or(Error::IndexOutOfRange {
            index: Vec::new(),
            bounds: vec![0],
        })?;
        Self::from_vec_in(&location, self.to_vec()?)
    }

    /// Copies every element of `src` into this buffer.
    ///
    /// # Errors
    ///
    /// `BackendMismatch` when the two buffers live in different places, `ShapeMismatch`
    /// when their lengths differ.
    pub fn copy_from(&self, src: &Self) -> Result<()> {
        let (Some(dst_loc), Some(src_loc)) = (self.location(), src.location()) else {
            return Err(Error::IndexOutOfRange {
                index: Vec::new(),
                bounds: vec![0],
            });
        };
        if !dst_loc.same_as(&src_loc) {
            return Err(Error::BackendMismatch {
                expected: dst_loc.to_string(),
                found: src_loc.to_string(),
            });
        }
        if self.len != src.len {
            return Err(Error::ShapeMismatch {
                left: vec![self.len],
                right: vec![src.len],
                context: "buffer copy",
            });
        }

        if let (Some(Storage::Device(dst)), Some(Storage::Device(from))) =
            (self.storage.as_deref(), src.storage.as_deref())
        {
            if self.element_stride == 1 && src.element_stride == 1 {
                let size = T::DATA_TYPE.size_bytes();
                return from.copy_to(src.offset * size, dst, self.offset * size, self.len * size);
            }
        }
        for (i, value) in src.to_vec()?.into_iter().enumerate() {
            self.set(i, value)?;
        }
        Ok(())
    }

    /// Drops this buffer's reference to its storage. Idempotent.
    ///
    /// Other views keep the storage alive; the last one to go frees it.
    pub fn release(&mut self) {
        self.storage = None;
    }
}

impl<T> Clone for DataBuffer<T> {
    /// Another reference to the same storage window.
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            offset: self.offset,
            len: self.len,
            element_stride: self.element_stride,
        }
    }
}

/// Array contents tagged with their element type.
#[derive(Debug, Clone)]
pub enum ArrayData {
    Float32(DataBuffer<f32>),
    Float64(DataBuffer<f64>),
}

macro_rules! with_buffer {
    ($data:expr, $buf:ident => $body:expr) => {
        match $data {
            ArrayData::Float32($buf) => $body,
            ArrayData::Float64($buf) => $body,
        }
    };
}

macro_rules! map_buffer {
    ($data:expr, $buf:ident => $body:expr) => {
        match $data {
            ArrayData::Float32($buf) => ArrayData::Float32($body),
            ArrayData::Float64($buf) => ArrayData::Float64($body),
        }
    };
}

impl ArrayData {
    /// Allocates `len` zeroed elements of `data_type` at `location`.
    pub fn allocate(data_type: DataType, len: usize, location: &Location) -> Result<Self> {
        Ok(match data_type {
            DataType::Float32 => Self::Float32(DataBuffer::allocate_in(location, len)?),
            DataType::Float64 => Self::Float64(DataBuffer::allocate_in(location, len)?),
        })
    }

    /// Converts `values` to `data_type` and stores them at `location`.
    ///
    /// # Errors
    ///
    /// `TypeConversionError` when a value does not fit the element type.
    pub fn from_f64(data_type: DataType, values: &[f64], location: &Location) -> Result<Self> {
        Ok(match data_type {
            DataType::Float32 => Self::Float32(DataBuffer::from_vec_in(
                location,
                values
                    .iter()
                    .map(|&v| f32::try_from_f64(v))
                    .collect::<Result<_>>()?,
            )?),
            DataType::Float64 => Self::Float64(DataBuffer::from_vec_in(location, values.to_vec())?),
        })
    }

    /// Stores arithmetic results, saturating values beyond the element range to infinity.
    pub(crate) fn from_f64_saturating(
        data_type: DataType,
        values: &[f64],
        location: &Location,
    ) -> Result<Self> {
        Ok(match data_type {
            DataType::Float32 => Self::Float32(DataBuffer::from_vec_in(
                location,
                values.iter().map(|&v| crate::dtype::narrow(v)).collect(),
            )?),
            DataType::Float64 => Self::Float64(DataBuffer::from_vec_in(location, values.to_vec())?),
        })
    }

    /// The element type.
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Float32(_) => DataType::Float32,
            Self::Float64(_) => DataType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        with_buffer!(self, b => b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_stride(&self) -> usize {
        with_buffer!(self, b => b.element_stride())
    }

    pub fn location(&self) -> Option<Location> {
        with_buffer!(self, b => b.location())
    }

    pub fn shares_storage(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float32(a), Self::Float32(b)) => a.shares_storage(b),
            (Self::Float64(a), Self::Float64(b)) => a.shares_storage(b),
            _ => false,
        }
    }

    /// Reads element `index` widened to `f64`.
    pub fn get_f64(&self, index: usize) -> Result<f64> {
        with_buffer!(self, b => b.get(index).map(Scalar::into_f64))
    }

    /// Writes `value` to element `index`.
    ///
    /// # Errors
    ///
    /// `TypeConversionError` when `value` does not fit the element type.
    pub fn set_f64(&self, index: usize, value: f64) -> Result<()> {
        match self {
            Self::Float32(b) => b.set(index, f32::try_from_f64(value)?),
            Self::Float64(b) => b.set(index, value),
        }
    }

    /// Reads the elements at `indices` widened to `f64`.
    pub fn gather_f64(&self, indices: &[usize]) -> Result<Vec<f64>> {
        with_buffer!(self, b => Ok(b.gather(indices)?.into_iter().map(Scalar::into_f64).collect()))
    }

    /// Little-endian encoding of the elements at `indices`, in order.
    pub(crate) fn gather_le_bytes(&self, indices: &[usize]) -> Result<Vec<u8>> {
        with_buffer!(self, b => Ok(encode_le(&b.gather(indices)?)))
    }

    /// Decodes little-endian elements of `data_type` and stores them at `location`.
    pub(crate) fn from_le_bytes(data_type: DataType, raw: &[u8], location: &Location) -> Result<Self> {
        fn decode<T: Element>(raw: &[u8]) -> Vec<T> {
            raw.chunks_exact(T::DATA_TYPE.size_bytes())
                .map(T::read_le)
                .collect()
        }
        Ok(match data_type {
            DataType::Float32 => Self::Float32(DataBuffer::from_vec_in(location, decode(raw))?),
            DataType::Float64 => Self::Float64(DataBuffer::from_vec_in(location, decode(raw))?),
        })
    }

    pub fn view(&self, start: usize, len: usize) -> Result<Self> {
        Ok(map_buffer!(self, b => b.view(start, len)?))
    }

    pub fn copy(&self) -> Result<Self> {
        Ok(map_buffer!(self, b => b.copy()?))
    }

    /// Copies `src` into this buffer; both must hold the same element type.
    pub fn copy_from(&self, src: &Self) -> Result<()> {
        match (self, src) {
            (Self::Float32(dst), Self::Float32(src)) => dst.copy_from(src),
            (Self::Float64(dst), Self::Float64(src)) => dst.copy_from(src),
            _ => Err(Error::BackendMismatch {
                expected: self.data_type().to_string(),
                found: src.data_type().to_string(),
            }),
        }
    }

    pub fn release(&mut self) {
        with_buffer!(self, b => b.release());
    }

    pub fn is_released(&self) -> bool {
        with_buffer!(self, b => b.is_released())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use assert_matches::assert_matches;

    #[test]
    fn get_set_bounds() {
        let buf = DataBuffer::<f64>::allocate(3);
        buf.set(2, 5.0).unwrap();
        assert_eq!(buf.to_vec().unwrap(), vec![0.0, 0.0, 5.0]);
        assert_matches!(buf.get(3), Err(Error::IndexOutOfRange { .. }));
        assert_matches!(buf.set(3, 1.0), Err(Error::IndexOutOfRange { .. }));
    }

    #[test]
    fn view_bounds_do_not_overflow() {
        let buf = DataBuffer::from_vec(vec![1.0f32, 2.0]);
        assert_matches!(buf.view(usize::MAX, 2), Err(Error::InvalidRange { .. }));
        assert_matches!(buf.view(1, usize::MAX), Err(Error::InvalidRange { .. }));
        assert_eq!(buf.view(1, 1).unwrap().to_vec().unwrap(), vec![2.0]);
    }

    #[test]
    fn views_share_and_outlive_the_owner() {
        let mut owner = DataBuffer::from_vec(vec![0.0f32, 1.0, 2.0, 3.0, 4.0]);
        let view = owner.view(1, 3).unwrap();
        let nested = view.view(1, 2).unwrap();
        assert!(nested.shares_storage(&owner));
        assert_eq!(nested.to_vec().unwrap(), vec![2.0, 3.0]);

        owner.release();
        owner.release();
        assert!(owner.is_released());
        assert_eq!(nested.get(1).unwrap(), 3.0);
        assert_matches!(view.view(2, 2), Err(Error::InvalidRange { .. }));
    }

    #[test]
    fn copy_is_independent() {
        let buf = DataBuffer::from_vec(vec![1.0f64, 2.0]);
        let copy = buf.copy().unwrap();
        copy.set(0, 9.0).unwrap();
        assert_eq!(buf.get(0).unwrap(), 1.0);
        assert!(!copy.shares_storage(&buf));
    }

    #[test]
    fn device_storage_is_freed_with_last_view() {
        let ctx = DeviceContext::host_staged(DeviceId(60));
        ctx.bind_to_current_thread();
        let location = Location::Device(Arc::clone(&ctx));

        let mut buf = DataBuffer::from_vec_in(&location, vec![1.0f32, 2.0, 3.0]).unwrap();
        let view = buf.view(1, 2).unwrap();
        buf.release();
        assert_eq!(ctx.live_allocations(), 1);
        assert_eq!(view.to_vec().unwrap(), vec![2.0, 3.0]);
        drop(view);
        assert_eq!(ctx.live_allocations(), 0);
    }

    #[test]
    fn copy_across_contexts_is_rejected() {
        let a = DeviceContext::host_staged(DeviceId(61));
        let b = DeviceContext::host_staged(DeviceId(62));
        a.bind_to_current_thread();
        let on_a = DataBuffer::<f32>::allocate_in(&Location::Device(a), 2).unwrap();
        b.bind_to_current_thread();
        let on_b = DataBuffer::<f32>::allocate_in(&Location::Device(b), 2).unwrap();
        let on_host = DataBuffer::<f32>::allocate(2);

        assert_matches!(on_b.copy_from(&on_a), Err(Error::BackendMismatch { .. }));
        assert_matches!(on_host.copy_from(&on_b), Err(Error::BackendMismatch { .. }));
    }

    #[test]
    fn device_copy_within_context() {
        let ctx = DeviceContext::host_staged(DeviceId(63));
        ctx.bind_to_current_thread();
        let location = Location::Device(ctx);
        let src = DataBuffer::from_vec_in(&location, vec![1.0f64, 2.0, 3.0]).unwrap();
        let dst = DataBuffer::<f64>::allocate_in(&location, 2).unwrap();
        dst.copy_from(&src.view(1, 2).unwrap()).unwrap();
        assert_eq!(dst.to_vec().unwrap(), vec![2.0, 3.0]);

        dst.set(1, -4.5).unwrap();
        assert_eq!(dst.gather(&[1, 0]).unwrap(), vec![-4.5, 2.0]);
        assert_eq!(src.get(2).unwrap(), 3.0);
    }
}
