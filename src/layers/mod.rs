//! Layer glue.
//!
//! Layers consume the array API only: they create their parameters through a
//! [`ComputationHandler`], keep them in a [`Registry`], and exchange activations with the
//! surrounding network through a [`LayerBuffer`] of named input and output registries.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::handler::ComputationHandler;
use crate::registry::Registry;

mod elementwise;
mod output;

pub use elementwise::ElementwiseLayer;
pub use output::OutputLayer;

/// Alias of the input and output every layer has unless it declares others.
pub const DEFAULT_ALIAS: &str = "default";

/// Registry key under which activations are exchanged.
pub const ACTIVATIONS: &str = "activations";

/// A network layer.
pub trait Layer: Send + fmt::Debug {
    /// Unique name within the network.
    fn name(&self) -> &str;

    fn expected_inputs(&self) -> &[String];

    fn expected_outputs(&self) -> &[String];

    /// Keys of [`parameters`](Self::parameters) an optimiser may update.
    fn trainable_parameters(&self) -> &[String];

    fn parameters(&self) -> &Registry;

    fn parameters_mut(&mut self) -> &mut Registry;

    /// Runs the layer on `buffer`.
    fn run(&mut self, buffer: &mut LayerBuffer, handler: &dyn ComputationHandler, training: bool) -> Result<()>;
}

/// Named input and output registries of one layer invocation.
#[derive(Debug, Default)]
pub struct LayerBuffer {
    inputs: HashMap<String, Registry>,
    outputs: HashMap<String, Registry>,
}

impl LayerBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The input registry for `alias`.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` when no input is connected under `alias`.
    pub fn input(&self, alias: &str) -> Result<&Registry> {
        self.inputs
            .get(alias)
            .ok_or_else(|| Error::KeyNotFound(format!("input alias {alias}")))
    }

    /// The input registry for `alias`, created empty if absent.
    pub fn input_mut(&mut self, alias: &str) -> &mut Registry {
        self.inputs.entry(alias.to_owned()).or_default()
    }

    pub fn output(&self, alias: &str) -> Result<&Registry> {
        self.outputs
            .get(alias)
            .ok_or_else(|| Error::KeyNotFound(format!("output alias {alias}")))
    }

    pub fn output_mut(&mut self, alias: &str) -> &mut Registry {
        self.outputs.entry(alias.to_owned()).or_default()
    }
}
