use std::sync::Arc;

use tracing::debug;

use crate::backend::{Backend, BackendTag};
use crate::buffer::Location;
use crate::device::{DeviceContext, DeviceId};
use crate::dtype::DataType;
use crate::error::Result;

use super::ComputationHandler;

/// Handler for `float32` arrays resident in device memory.
///
/// Every operation, including array creation and element reads through the handler, requires
/// the handler's [`DeviceContext`] to be bound to the calling thread and fails with
/// `ContextNotBound` otherwise. Workers bind the context when they start running (see
/// [`DeviceBoundUnit`](crate::worker::DeviceBoundUnit)).
#[derive(Debug, Clone)]
pub struct CudaHandler {
    context: Arc<DeviceContext>,
    tag: BackendTag,
}

impl CudaHandler {
    /// A handler placing arrays on `context`.
    pub fn new(context: Arc<DeviceContext>) -> Self {
        let tag = BackendTag::next(Backend::Cuda);
        debug!(device = %context.id(), handler = %tag, "created device handler");
        Self { context, tag }
    }

    /// A handler on device `id` using the default device memory runtime.
    ///
    /// With the `cuda` feature the memory lives in real GPU buffers through `wgpu`;
    /// otherwise it is host-staged.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Device` when the GPU runtime cannot be initialised.
    pub fn open(id: DeviceId) -> Result<Self> {
        #[cfg(feature = "cuda")]
        let context = DeviceContext::wgpu(id)?;
        #[cfg(not(feature = "cuda"))]
        let context = DeviceContext::host_staged(id);
        Ok(Self::new(context))
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }
}

impl ComputationHandler for CudaHandler {
    fn data_type(&self) -> DataType {
        DataType::Float32
    }

    fn backend_tag(&self) -> BackendTag {
        self.tag
    }

    fn location(&self) -> Location {
        Location::Device(Arc::clone(&self.context))
    }

    fn check_ready(&self) -> Result<()> {
        self.context.ensure_bound()
    }
}
