//! Backend identification.
//!
//! # Supported Backends
//!
//! - `Cpu`: Pure Rust backend using host memory and `rayon` (default).
//! - `Cuda`: GPU device handler. Arrays live in the memory of a
//!   [`DeviceContext`](crate::device::DeviceContext): host-staged by default, real GPU
//!   buffers through `wgpu` when the `cuda` feature is enabled.
//!
//! A [`Backend`] is a plain value: every handler carries its own, and every array records
//! the [`BackendTag`] of the handler instance that created it. There is no process-wide
//! backend switch.

use core::convert::TryFrom;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Enumeration of supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Backend {
    /// Pure CPU-based backend (default).
    #[default]
    Cpu = 0,
    /// GPU device backend.
    Cuda,
}

impl TryFrom<u8> for Backend {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Cuda),
            other => Err(Error::UnsupportedFormat(format!(
                "unknown backend tag {other}"
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda => f.write_str("cuda"),
        }
    }
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// Identifies one handler instance of a backend.
///
/// Arrays remember the tag of the handler that created them; handlers refuse arrays
/// carrying a foreign tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendTag {
    backend: Backend,
    instance: u64,
}

impl BackendTag {
    /// Allocates a fresh tag for a new handler instance.
    pub fn next(backend: Backend) -> Self {
        Self {
            backend,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The backend kind.
    pub const fn backend(&self) -> Backend {
        self.backend
    }

    /// The instance number, unique within the process.
    pub const fn instance(&self) -> u64 {
        self.instance
    }
}

impl fmt::Display for BackendTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.backend, self.instance)
    }
}
