use tracing::trace;

use super::{ACTIVATIONS, DEFAULT_ALIAS, Layer, LayerBuffer};
use crate::error::Result;
use crate::handler::ComputationHandler;
use crate::ndarray::NDArray;
use crate::registry::Registry;
use crate::shape;

/// Marks the boundary of a network: forwards its default input activations to an external
/// output alias.
#[derive(Debug)]
pub struct OutputLayer {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    parameters: Registry,
}

impl OutputLayer {
    /// An output layer exposing activations of `shape` under `external_output_alias`.
    ///
    /// # Errors
    ///
    /// `InvalidShape` for an empty shape or a zero dimension.
    pub fn new(name: impl Into<String>, external_output_alias: impl Into<String>, shape: &[usize]) -> Result<Self> {
        shape::check_shape(shape)?;
        let alias = external_output_alias.into();
        let mut parameters = Registry::new();
        parameters.set("external_output_alias", alias.clone());
        parameters.set("shape", shape.to_vec());
        parameters.set("size", shape::product(shape));
        Ok(Self {
            name: name.into(),
            inputs: vec![DEFAULT_ALIAS.to_owned()],
            outputs: vec![alias],
            parameters,
        })
    }
}

impl Layer for OutputLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn expected_inputs(&self) -> &[String] {
        &self.inputs
    }

    fn expected_outputs(&self) -> &[String] {
        &self.outputs
    }

    fn trainable_parameters(&self) -> &[String] {
        &[]
    }

    fn parameters(&self) -> &Registry {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut Registry {
        &mut self.parameters
    }

    fn run(&mut self, buffer: &mut LayerBuffer, _handler: &dyn ComputationHandler, _training: bool) -> Result<()> {
        let alias = self.parameters.get::<String>("external_output_alias")?;
        let activations = buffer.input(DEFAULT_ALIAS)?.get::<NDArray>(ACTIVATIONS)?;
        trace!(layer = %self.name, %alias, shape = ?activations.shape(), "forwarding activations");
        buffer.output_mut(&alias).set(ACTIVATIONS, activations);
        Ok(())
    }
}
