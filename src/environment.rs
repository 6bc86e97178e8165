//! Explicit runtime context.
//!
//! An [`Environment`] is passed to iterators and layers instead of being looked up from a
//! process-wide singleton. It carries a name (used in log events) and a root [`Registry`]
//! for settings shared across a training run.

use crate::registry::Registry;

/// Named context object shared by the components of one run.
#[derive(Debug, Default)]
pub struct Environment {
    name: String,
    registry: Registry,
}

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: Registry::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }
}
