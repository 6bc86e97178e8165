use crate::backend::{Backend, BackendTag};
use crate::buffer::Location;
use crate::dtype::DataType;
use crate::error::Result;

use super::ComputationHandler;

/// Handler for arrays in host memory.
///
/// Every instance has its own [`BackendTag`]; arrays created by one `CpuHandler` are
/// rejected by another.
#[derive(Debug, Clone)]
pub struct CpuHandler {
    data_type: DataType,
    tag: BackendTag,
}

impl CpuHandler {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            tag: BackendTag::next(Backend::Cpu),
        }
    }

    pub fn float32() -> Self {
        Self::new(DataType::Float32)
    }

    pub fn float64() -> Self {
        Self::new(DataType::Float64)
    }
}

impl ComputationHandler for CpuHandler {
    fn data_type(&self) -> DataType {
        self.data_type
    }

    fn backend_tag(&self) -> BackendTag {
        self.tag
    }

    fn location(&self) -> Location {
        Location::Host
    }

    fn check_ready(&self) -> Result<()> {
        Ok(())
    }
}
