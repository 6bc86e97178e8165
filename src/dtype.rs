//! Element types.
//!
//! [`DataType`] is the runtime tag of an array's element type. [`Element`] is implemented
//! by the native element types buffers can hold, and [`Scalar`] by every primitive a value
//! can be read as or written from through [`NDArray::get_value`](crate::NDArray::get_value)
//! and [`NDArray::set_value`](crate::NDArray::set_value).

use std::fmt;

use crate::error::{Error, Result};

/// Runtime tag of a buffer's element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    /// 32-bit IEEE float.
    Float32 = 0,
    /// 64-bit IEEE float.
    Float64 = 1,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Float32),
            1 => Ok(Self::Float64),
            other => Err(Error::UnsupportedFormat(format!(
                "unknown element type tag {other}"
            ))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float32 => f.write_str("float32"),
            Self::Float64 => f.write_str("float64"),
        }
    }
}

/// Checked conversion of primitive values to and from `f64`.
pub trait Scalar: Copy {
    /// Type name used in conversion errors.
    const NAME: &'static str;

    /// Widens `self` to `f64`.
    fn into_f64(self) -> f64;

    /// Narrows `value` into `Self`.
    ///
    /// Fractions are truncated toward zero for integer targets. Non-finite values and
    /// values outside the target range are rejected.
    fn from_f64(value: f64) -> Option<Self>;

    /// Like [`Scalar::from_f64`], failing with `TypeConversionError`.
    fn try_from_f64(value: f64) -> Result<Self> {
        Self::from_f64(value).ok_or(Error::TypeConversionError {
            value,
            target: Self::NAME,
        })
    }
}

impl Scalar for f64 {
    const NAME: &'static str = "f64";

    fn into_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Option<Self> {
        Some(value)
    }
}

impl Scalar for f32 {
    const NAME: &'static str = "f32";

    fn into_f64(self) -> f64 {
        f64::from(self)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_f64(value: f64) -> Option<Self> {
        if value.is_finite() && value.abs() > f64::from(f32::MAX) {
            return None;
        }
        Some(value as f32)
    }
}

macro_rules! integer_scalar {
    ($($ty:ident),*) => {
        $(
            impl Scalar for $ty {
                const NAME: &'static str = stringify!($ty);

                #[allow(clippy::cast_precision_loss)]
                fn into_f64(self) -> f64 {
                    self as f64
                }

                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
                fn from_f64(value: f64) -> Option<Self> {
                    let truncated = value.trunc();
                    if !truncated.is_finite()
                        || truncated < $ty::MIN as f64
                        || truncated > $ty::MAX as f64
                    {
                        return None;
                    }
                    Some(truncated as $ty)
                }
            }
        )*
    };
}

integer_scalar!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

/// Native element type of a data buffer.
///
/// Elements are plain old data: device uploads and readbacks reinterpret element slices as
/// bytes with `bytemuck`. Serialised records use the explicit little-endian encoding.
pub trait Element:
    Scalar + bytemuck::Pod + Default + PartialEq + fmt::Debug + Send + Sync + 'static
{
    /// Runtime tag of this element type.
    const DATA_TYPE: DataType;

    /// Writes the record encoding of `self` into `out` (`DATA_TYPE.size_bytes()` long).
    fn write_le(self, out: &mut [u8]);

    /// Reads a value from its record encoding.
    fn read_le(bytes: &[u8]) -> Self;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::Float32;

    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut raw = [0; 4];
        raw.copy_from_slice(&bytes[..4]);
        Self::from_le_bytes(raw)
    }
}

impl Element for f64 {
    const DATA_TYPE: DataType = DataType::Float64;

    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut raw = [0; 8];
        raw.copy_from_slice(&bytes[..8]);
        Self::from_le_bytes(raw)
    }
}

/// Stores an arithmetic result computed in `f64`, saturating to infinity on overflow.
///
/// Only kernel outputs go through here. Caller-supplied values are converted with
/// [`Scalar::try_from_f64`] and fail instead.
pub(crate) fn narrow<T: Element>(value: f64) -> T {
    T::from_f64(value)
        .or_else(|| T::from_f64(value.signum() * f64::INFINITY))
        .unwrap_or_default()
}
