//! Gradient optimisers.
//!
//! Optimisers are written entirely in handler primitives, so they run unchanged on every
//! backend. Hyperparameters live in the optimiser's [`Registry`]; optimisers with
//! per-parameter memory keep it there too, keyed by parameter identifier
//! (`"<layer>.<parameter>"`).
//!
//! # Example
//!
//! ```rust
//! use sigma_core::handler::{Arithmetic, ComputationHandler, CpuHandler};
//! use sigma_core::optim::{GradientOptimiser, SgdOptimiser};
//!
//! let handler = CpuHandler::float64();
//! let param = handler.create_from(&[2], &[1.0, 2.0]).unwrap();
//! let grad = handler.create_from(&[2], &[10.0, -10.0]).unwrap();
//!
//! let mut sgd = SgdOptimiser::new(0.1);
//! let updated = sgd.optimise("w", &param, &grad, &handler).unwrap();
//! assert_eq!(updated.get_data_as::<f64>().unwrap(), vec![0.0, 3.0]);
//! ```

use std::fmt;

use tracing::debug;

use crate::error::{Error, Result};
use crate::handler::{Arithmetic, ComputationHandler};
use crate::layers::Layer;
use crate::ndarray::NDArray;
use crate::registry::Registry;
use crate::trace::Gradients;

/// Updates parameters from their gradients.
pub trait GradientOptimiser: Send + fmt::Debug {
    /// Hyperparameters and memory.
    fn registry(&self) -> &Registry;

    /// The updated value of parameter `id` given its `gradient`.
    fn optimise(
        &mut self,
        id: &str,
        parameter: &NDArray,
        gradient: &NDArray,
        handler: &dyn ComputationHandler,
    ) -> Result<NDArray>;

    /// Updates every trainable parameter of `layer` that received a gradient.
    ///
    /// Updated parameters are stored back as fresh traced leaves.
    fn step(
        &mut self,
        layer: &mut dyn Layer,
        gradients: &Gradients,
        handler: &dyn ComputationHandler,
    ) -> Result<()> {
        for name in layer.trainable_parameters().to_vec() {
            let parameter = layer.parameters().get::<NDArray>(&name)?;
            let Some(gradient) = parameter.trace().and_then(|t| gradients.get(t)) else {
                continue;
            };
            let gradient = handler.create_from(parameter.shape(), gradient)?;
            let id = format!("{}.{name}", layer.name());
            let updated = self.optimise(&id, &parameter, &gradient, handler)?;
            debug!(parameter = %id, "updated parameter");
            layer.parameters_mut().set(name, handler.trace(&updated)?);
        }
        Ok(())
    }
}

/// Plain gradient descent: `parameter - learning_rate * gradient`.
#[derive(Debug)]
pub struct SgdOptimiser {
    registry: Registry,
}

impl SgdOptimiser {
    pub fn new(learning_rate: f64) -> Self {
        let mut registry = Registry::new();
        registry.set("learning_rate", learning_rate);
        Self { registry }
    }
}

impl GradientOptimiser for SgdOptimiser {
    fn registry(&self) -> &Registry {
        &self.registry
    }

    fn optimise(
        &mut self,
        _id: &str,
        parameter: &NDArray,
        gradient: &NDArray,
        handler: &dyn ComputationHandler,
    ) -> Result<NDArray> {
        let learning_rate = self.registry.get::<f64>("learning_rate")?;
        let step = handler.multiply(gradient, learning_rate)?;
        handler.subtract(parameter, &step)
    }
}

/// Adagrad: scales the learning rate of each element by the inverse square root of its
/// accumulated squared gradients.
///
/// ```text
/// memory    += gradient²
/// parameter += gradient * -(base_learning_rate / sqrt(memory + smoothing))
/// ```
#[derive(Debug)]
pub struct AdagradOptimiser {
    registry: Registry,
}

impl AdagradOptimiser {
    const MEMORY: &'static str = "memory_squared_gradient";

    pub fn new(base_learning_rate: f64, smoothing: f64) -> Self {
        let mut registry = Registry::new();
        registry.set("base_learning_rate", base_learning_rate);
        registry.set("smoothing", smoothing);
        Self { registry }
    }

    /// Accumulated squared gradients of parameter `id`, if it was optimised before.
    pub fn memory(&self, id: &str) -> Option<&NDArray> {
        self.registry
            .get_ref::<NDArray>(&format!("{}.{id}", Self::MEMORY))
            .ok()
    }
}

impl Default for AdagradOptimiser {
    fn default() -> Self {
        Self::new(0.01, 1e-6)
    }
}

impl GradientOptimiser for AdagradOptimiser {
    fn registry(&self) -> &Registry {
        &self.registry
    }

    fn optimise(
        &mut self,
        id: &str,
        parameter: &NDArray,
        gradient: &NDArray,
        handler: &dyn ComputationHandler,
    ) -> Result<NDArray> {
        let learning_rate = self.registry.get::<f64>("base_learning_rate")?;
        let smoothing = self.registry.get::<f64>("smoothing")?;
        let key = format!("{}.{id}", Self::MEMORY);

        let squared = handler.multiply(gradient, gradient)?;
        let memory = match self.registry.get_ref::<NDArray>(&key) {
            Ok(previous) => handler.add(previous, &squared)?,
            Err(Error::KeyNotFound(_)) => squared,
            Err(err) => return Err(err),
        };
        let smoothed = handler.square_root(&handler.add(&memory, smoothing)?)?;
        let rate = handler.divide(learning_rate, &smoothed)?;
        let update = handler.multiply(gradient, &handler.multiply(&rate, -1.0)?)?;
        self.registry.set(key, memory);

        handler.add(parameter, &update)
    }
}
