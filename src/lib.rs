//! sigma_core: autodiff-aware n-dimensional arrays over pluggable computation handlers.
//!
//! Arrays are created, combined and serialised by a [`ComputationHandler`], the single
//! authority for one element type on one backend. Handlers for host memory
//! ([`CpuHandler`]) and for device memory ([`CudaHandler`]) share the same contract, so
//! everything above them (layers, optimisers, data pipelines) is backend-agnostic.
//!
//! # Features
//!
//! - Strided arrays with zero-copy reshape, permute and slice views.
//! - Broadcasting elementwise arithmetic with reverse-mode gradients.
//! - Checksummed binary serialisation of single arrays and whole model files.
//! - Byte-record extraction into blocked datasets with per-iterator cursors.
//! - Pause/resume workers with per-thread device binding.
//!
//! # Modules
//!
//! - [`ndarray`] and [`number`]: arrays and scalars.
//! - [`handler`]: array factories and arithmetic.
//! - [`trace`]: gradient recording and backpropagation.
//! - [`buffer`] and [`device`]: host and device storage.
//! - [`data`]: record extraction, datasets and iterators.
//! - [`layers`], [`optim`] and [`worker`]: the training-side glue.
//! - [`modelio`]: saving and loading array collections.
//!
//! # Cargo features
//!
//! - `wgpu`: device memory through the default `wgpu` adapter.
//! - `cuda`: makes [`CudaHandler::open`] use the `wgpu` runtime instead of host-staged memory.
//!
//! # Example
//!
//! ```rust
//! use sigma_core::{Arithmetic, ComputationHandler, CpuHandler};
//!
//! let handler = CpuHandler::float64();
//! let x = handler.trace(&handler.create_from(&[2], &[3.0, 4.0]).unwrap()).unwrap();
//! let y = handler.sum(&handler.multiply(&x, &x).unwrap()).unwrap();
//! assert_eq!(y.get_data_as::<f64>().unwrap(), vec![25.0]);
//!
//! let grads = y.trace().unwrap().gradients();
//! assert_eq!(grads.get(x.trace().unwrap()).unwrap(), &[6.0, 8.0]);
//! ```

pub mod backend;
pub mod buffer;
pub mod data;
pub mod device;
pub mod dtype;
pub mod environment;
pub mod error;
pub mod handler;
pub mod layers;
pub mod modelio;
pub mod ndarray;
pub mod number;
pub mod optim;
pub mod registry;
pub mod shape;
pub mod trace;
pub mod worker;

pub use backend::{Backend, BackendTag};
pub use dtype::DataType;
pub use environment::Environment;
pub use error::{Error, Result};
pub use handler::{Arithmetic, ComputationHandler, CpuHandler, CudaHandler, Operand};
pub use ndarray::NDArray;
pub use number::Number;
pub use registry::Registry;
