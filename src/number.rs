//! Rank-0 scalar values.
//!
//! A [`Number`] holds one value, its element type and the tag of the handler it is
//! associated with. Handler arithmetic accepts a `Number` anywhere an array is accepted
//! and treats it as an array of shape `[1]`, broadcasting it against the other operand.

use crate::backend::BackendTag;
use crate::dtype::{DataType, Scalar};
use crate::error::{Error, Result};
use crate::ndarray::NDArray;
use crate::trace::Trace;

/// A single scalar with an optional handler association and trace.
#[derive(Debug, Clone)]
pub struct Number {
    value: f64,
    data_type: DataType,
    handler: Option<BackendTag>,
    trace: Option<Trace>,
}

fn stored(value: f64, data_type: DataType) -> Result<f64> {
    match data_type {
        DataType::Float32 => f32::try_from_f64(value).map(f64::from),
        DataType::Float64 => Ok(value),
    }
}

impl Number {
    /// A number not associated with any handler.
    ///
    /// # Errors
    ///
    /// `TypeConversionError` when `value` does not fit `data_type`.
    pub fn new(value: f64, data_type: DataType) -> Result<Self> {
        Ok(Self {
            value: stored(value, data_type)?,
            data_type,
            handler: None,
            trace: None,
        })
    }

    pub(crate) fn associated(value: f64, data_type: DataType, handler: BackendTag) -> Result<Self> {
        let mut number = Self::new(value, data_type)?;
        number.handler = Some(handler);
        Ok(number)
    }

    pub(crate) fn with_trace(mut self, trace: Trace) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Reads a single-element array (any shape of length 1) as a number.
    ///
    /// The array's trace, if any, is carried over reshaped to `[1]`.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when the array holds more than one element.
    pub fn from_array(array: &NDArray) -> Result<Self> {
        if array.length() != 1 {
            return Err(Error::ShapeMismatch {
                left: array.shape().to_vec(),
                right: vec![1],
                context: "a number holds exactly one element",
            });
        }
        let value = array.to_f64_vec()?[0];
        let trace = array.trace().map(|t| {
            if t.shape() == [1] {
                t.clone()
            } else {
                t.reshape(&[1], false)
            }
        });
        Ok(Self {
            value,
            data_type: array.data_type(),
            handler: Some(array.backend_tag()),
            trace,
        })
    }

    /// The value widened to `f64`.
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn get_value<T: Scalar>(&self) -> Result<T> {
        T::try_from_f64(self.value)
    }

    /// Replaces the value, rounding it to the element type.
    pub fn set_value<T: Scalar>(&mut self, value: T) -> Result<()> {
        self.value = stored(value.into_f64(), self.data_type)?;
        Ok(())
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Tag of the associated handler.
    pub fn handler_tag(&self) -> Option<BackendTag> {
        self.handler
    }

    pub fn trace(&self) -> Option<&Trace> {
        self.trace.as_ref()
    }

    pub fn is_traced(&self) -> bool {
        self.trace.is_some()
    }

    /// An independent duplicate keeping the value and the handler association.
    ///
    /// A traced number gets a fresh leaf trace.
    pub fn deep_copy(&self) -> Self {
        Self {
            value: self.value,
            data_type: self.data_type,
            handler: self.handler,
            trace: self.trace.as_ref().map(|_| Trace::leaf(&[1])),
        }
    }
}
