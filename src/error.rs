//! Crate-wide error type.
//!
//! Every validation failure is raised at the call that violates the contract and carries
//! the offending shape, indices, key or alias so the failing call can be identified
//! without knowing the internal buffer layout.

use crate::backend::BackendTag;
use crate::device::DeviceId;

/// Errors raised by arrays, buffers, handlers and the surrounding glue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid shape {shape:?}: every dimension must be > 0 and the rank must be >= 1")]
    InvalidShape { shape: Vec<usize> },
    #[error("shape mismatch: {left:?} is not compatible with {right:?} ({context})")]
    ShapeMismatch {
        left: Vec<usize>,
        right: Vec<usize>,
        context: &'static str,
    },
    #[error("{dims:?} is not a permutation of the dimensions [0, {rank})")]
    InvalidPermutation { dims: Vec<usize>, rank: usize },
    #[error("invalid range [{begin:?}, {end:?}) for shape {shape:?}")]
    InvalidRange {
        begin: Vec<usize>,
        end: Vec<usize>,
        shape: Vec<usize>,
    },
    #[error("index {index:?} is out of range for bounds {bounds:?}")]
    IndexOutOfRange {
        index: Vec<usize>,
        bounds: Vec<usize>,
    },
    #[error("backend mismatch: expected {expected}, found {found}")]
    BackendMismatch { expected: String, found: String },
    #[error("device context {device} is not bound to the current thread")]
    ContextNotBound { device: DeviceId },
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("cannot convert {value} to {target}")]
    TypeConversionError { value: f64, target: &'static str },
    #[error("registry key {0:?} not found")]
    KeyNotFound(String),
    #[error("registry key {key:?} holds a {found}, not a {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid argument: {0}")]
    ArgumentError(String),
    #[error("corrupted data: {0}")]
    CorruptedData(&'static str),
    #[error("device {device} failure: {message}")]
    Device { device: DeviceId, message: String },
    #[error("worker {worker:?} cannot go from {from} to {to}")]
    InvalidTransition {
        worker: String,
        from: &'static str,
        to: &'static str,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn backend_mismatch(expected: &BackendTag, found: &BackendTag) -> Self {
        Self::BackendMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

/// Shorthand for results carrying [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
