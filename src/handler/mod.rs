//! Computation handlers.
//!
//! A [`ComputationHandler`] is the single authority for creating arrays of one element type
//! on one backend instance, for serialising them and for computing their size. It also
//! provides the arithmetic primitives, which broadcast their operands numpy-style and route
//! every traced operand through the autodiff graph.
//!
//! Handlers are stateless with respect to the arrays they create. The only backend state is
//! the device binding of the calling thread, which GPU handlers check before every
//! operation.
//!
//! ## Backends
//!
//! - [`CpuHandler`]: host memory, `float32` or `float64`
//! - [`CudaHandler`]: `float32` arrays in the memory of a [`DeviceContext`]
//!
//! ## Operands
//!
//! Arithmetic takes [`Operand`]s: arrays, [`Number`]s and plain `f64` scalars. Numbers and
//! scalars behave as arrays of shape `[1]`. The [`Arithmetic`] shorthands accept anything
//! convertible into an operand.
//!
//! # Example
//!
//! ```rust
//! use sigma_core::handler::{Arithmetic, ComputationHandler, CpuHandler};
//!
//! let handler = CpuHandler::float32();
//! let x = handler.trace(&handler.create_from(&[2], &[1.0, 4.0]).unwrap()).unwrap();
//!
//! let y = handler.multiply(&x, 3.0).unwrap();
//! let z = handler.sum(&y).unwrap();
//! assert_eq!(z.get_value::<f32>(&[0]).unwrap(), 15.0);
//!
//! let grads = z.trace().unwrap().gradients();
//! assert_eq!(grads.get(x.trace().unwrap()).unwrap(), &[3.0, 3.0]);
//! ```
//!
//! [`DeviceContext`]: crate::device::DeviceContext

use std::fmt;
use std::io::{Read, Write};

use crate::backend::{Backend, BackendTag};
use crate::buffer::{ArrayData, Location};
use crate::dtype::DataType;
use crate::error::{Error, Result};
use crate::ndarray::NDArray;
use crate::number::Number;
use crate::shape;
use crate::trace::Trace;

mod cpu;
mod cuda;
pub(crate) mod io;
mod ops;

pub use cpu::CpuHandler;
pub use cuda::CudaHandler;
pub use ops::BinaryOp;

/// An argument of a handler arithmetic primitive.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    Array(&'a NDArray),
    Number(&'a Number),
    Scalar(f64),
}

impl<'a> From<&'a NDArray> for Operand<'a> {
    fn from(array: &'a NDArray) -> Self {
        Self::Array(array)
    }
}

impl<'a> From<&'a Number> for Operand<'a> {
    fn from(number: &'a Number) -> Self {
        Self::Number(number)
    }
}

impl From<f64> for Operand<'_> {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

/// Backend-specific array factory and operation dispatcher.
///
/// Implementors provide the backend primitives (`data_type`, `backend_tag`, `location`,
/// `check_ready`); everything else is derived from them.
pub trait ComputationHandler: Send + Sync + fmt::Debug {
    /// Element type of every array this handler creates.
    fn data_type(&self) -> DataType;

    /// Tag of this handler instance.
    fn backend_tag(&self) -> BackendTag;

    /// Where this handler places new buffers.
    fn location(&self) -> Location;

    /// Fails unless the calling thread may issue operations on this backend.
    ///
    /// GPU handlers fail with `ContextNotBound` when their device context is not bound to
    /// the calling thread.
    fn check_ready(&self) -> Result<()>;

    fn backend(&self) -> Backend {
        self.backend_tag().backend()
    }

    /// Fails with `BackendMismatch` unless `array` was created by this handler instance.
    fn check_owned(&self, array: &NDArray) -> Result<()> {
        let tag = self.backend_tag();
        if array.backend_tag() != tag {
            return Err(Error::backend_mismatch(&tag, &array.backend_tag()));
        }
        Ok(())
    }

    /// A zero-initialised array of `shape`.
    ///
    /// # Errors
    ///
    /// `InvalidShape` for an empty shape or a zero dimension.
    fn create(&self, shape: &[usize]) -> Result<NDArray> {
        self.check_ready()?;
        shape::check_shape(shape)?;
        let data = ArrayData::allocate(self.data_type(), shape::product(shape), &self.location())?;
        NDArray::from_data(data, shape.to_vec(), self.backend_tag())
    }

    /// An array of `shape` holding `values` in row-major order.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when `values.len() != product(shape)`.
    fn create_from(&self, shape: &[usize], values: &[f64]) -> Result<NDArray> {
        self.check_ready()?;
        shape::check_shape(shape)?;
        if values.len() != shape::product(shape) {
            return Err(Error::ShapeMismatch {
                left: shape.to_vec(),
                right: vec![values.len()],
                context: "value count does not match shape",
            });
        }
        let data = ArrayData::from_f64(self.data_type(), values, &self.location())?;
        NDArray::from_data(data, shape.to_vec(), self.backend_tag())
    }

    /// A number associated with this handler.
    fn number(&self, value: f64) -> Result<Number> {
        Number::associated(value, self.data_type(), self.backend_tag())
    }

    /// Shares `array`'s storage under a fresh leaf trace.
    fn trace(&self, array: &NDArray) -> Result<NDArray> {
        self.check_owned(array)?;
        Ok(array.clone().with_trace(Trace::leaf(array.shape())))
    }

    /// `number` under a fresh leaf trace.
    fn trace_number(&self, number: &Number) -> Result<Number> {
        Ok(number.clone().with_trace(Trace::leaf(&[1])))
    }

    /// Writes `array` in this handler family's binary format.
    fn serialise(&self, array: &NDArray, sink: &mut dyn Write) -> Result<()> {
        io::check_family(self, array)?;
        self.check_ready()?;
        io::write_array(array, sink)
    }

    /// Reads an array written by [`serialise`](Self::serialise) on a handler of the same
    /// family, placing it on this handler.
    fn deserialise(&self, source: &mut dyn Read) -> Result<NDArray> {
        self.check_ready()?;
        let packed = io::read_array(source)?;
        if packed.data_type != self.data_type() || packed.backend != self.backend() {
            return Err(Error::UnsupportedFormat(format!(
                "{} {} data cannot be read by a {} {} handler",
                packed.backend,
                packed.data_type,
                self.backend(),
                self.data_type()
            )));
        }
        let data = ArrayData::from_le_bytes(packed.data_type, &packed.data, &self.location())?;
        NDArray::from_data(data, packed.shape, self.backend_tag())
    }

    /// In-memory (or on-device) size of `array`: its elements plus shape and strides.
    ///
    /// # Errors
    ///
    /// `UnsupportedFormat` when `array` was not created by this handler instance.
    fn size_bytes(&self, array: &NDArray) -> Result<usize> {
        let tag = self.backend_tag();
        if array.backend_tag() != tag {
            return Err(Error::UnsupportedFormat(format!(
                "{tag} cannot size an array created by {}",
                array.backend_tag()
            )));
        }
        Ok(array.length() * array.data_type().size_bytes()
            + 2 * array.rank() * size_of::<usize>())
    }

    /// Elementwise binary operation with broadcasting.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when the operand shapes are not broadcast-compatible,
    /// `BackendMismatch` when an operand belongs to another handler instance.
    fn apply_binary(&self, op: BinaryOp, a: Operand<'_>, b: Operand<'_>) -> Result<NDArray> {
        ops::binary(self, op, a, b)
    }

    /// Elementwise square root.
    fn apply_square_root(&self, a: Operand<'_>) -> Result<NDArray> {
        ops::square_root(self, a)
    }

    /// Sum of every element, as an array of shape `[1]`.
    fn apply_sum(&self, a: Operand<'_>) -> Result<NDArray> {
        ops::sum(self, a)
    }
}

/// Arithmetic shorthands over anything convertible to an [`Operand`].
///
/// Implemented for every handler, including `dyn ComputationHandler`.
pub trait Arithmetic: ComputationHandler {
    fn add<'a>(&self, a: impl Into<Operand<'a>>, b: impl Into<Operand<'a>>) -> Result<NDArray> {
        self.apply_binary(BinaryOp::Add, a.into(), b.into())
    }

    fn subtract<'a>(&self, a: impl Into<Operand<'a>>, b: impl Into<Operand<'a>>) -> Result<NDArray> {
        self.apply_binary(BinaryOp::Subtract, a.into(), b.into())
    }

    fn multiply<'a>(&self, a: impl Into<Operand<'a>>, b: impl Into<Operand<'a>>) -> Result<NDArray> {
        self.apply_binary(BinaryOp::Multiply, a.into(), b.into())
    }

    fn divide<'a>(&self, a: impl Into<Operand<'a>>, b: impl Into<Operand<'a>>) -> Result<NDArray> {
        self.apply_binary(BinaryOp::Divide, a.into(), b.into())
    }

    fn square_root<'a>(&self, a: impl Into<Operand<'a>>) -> Result<NDArray> {
        self.apply_square_root(a.into())
    }

    fn sum<'a>(&self, a: impl Into<Operand<'a>>) -> Result<NDArray> {
        self.apply_sum(a.into())
    }
}

impl<H: ComputationHandler + ?Sized> Arithmetic for H {}

impl fmt::Display for Operand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array(a) => write!(f, "array{:?}", a.shape()),
            Self::Number(n) => write!(f, "number({})", n.value()),
            Self::Scalar(v) => write!(f, "scalar({v})"),
        }
    }
}
