use super::{ACTIVATIONS, DEFAULT_ALIAS, Layer, LayerBuffer};
use crate::error::Result;
use crate::handler::{Arithmetic, ComputationHandler};
use crate::ndarray::NDArray;
use crate::registry::Registry;

/// `activations = inputs * weights + biases`, elementwise over the feature shape.
///
/// Weights start at one and biases at zero. Both are stored as traced arrays so gradients
/// with respect to them can be read off any result computed from the activations.
#[derive(Debug)]
pub struct ElementwiseLayer {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    trainable: Vec<String>,
    parameters: Registry,
}

impl ElementwiseLayer {
    pub fn new(name: impl Into<String>, shape: &[usize], handler: &dyn ComputationHandler) -> Result<Self> {
        let size: usize = shape.iter().product();
        let weights = handler.create_from(shape, &vec![1.0; size])?;
        let biases = handler.create(shape)?;

        let mut parameters = Registry::new();
        parameters.set("shape", shape.to_vec());
        parameters.set("weights", handler.trace(&weights)?);
        parameters.set("biases", handler.trace(&biases)?);
        Ok(Self {
            name: name.into(),
            inputs: vec![DEFAULT_ALIAS.to_owned()],
            outputs: vec![DEFAULT_ALIAS.to_owned()],
            trainable: vec!["weights".to_owned(), "biases".to_owned()],
            parameters,
        })
    }
}

impl Layer for ElementwiseLayer {
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
        &self.trainable
    }

    fn parameters(&self) -> &Registry {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut Registry {
        &mut self.parameters
    }

    fn run(&mut self, buffer: &mut LayerBuffer, handler: &dyn ComputationHandler, _training: bool) -> Result<()> {
        let inputs = buffer.input(DEFAULT_ALIAS)?.get_ref::<NDArray>(ACTIVATIONS)?;
        let weights = self.parameters.get_ref::<NDArray>("weights")?;
        let biases = self.parameters.get_ref::<NDArray>("biases")?;

        let scaled = handler.multiply(inputs, weights)?;
        let activations = handler.add(&scaled, biases)?;
        buffer.output_mut(DEFAULT_ALIAS).set(ACTIVATIONS, activations);
        Ok(())
    }
}
