//! Device memory resident in host RAM.
//!
//! Used by the CUDA handler when no GPU runtime is compiled in, and by tests. It honours
//! the same allocation, binding and accounting rules as real device memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{AllocationId, DeviceMemory, MemoryError};

/// Host-staged device memory.
#[derive(Debug, Default)]
pub struct HostStagedMemory {
    next: AtomicU64,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
}

impl HostStagedMemory {
    fn with_block<R>(
        &self,
        id: AllocationId,
        f: impl FnOnce(&mut Vec<u8>) -> Result<R, MemoryError>,
    ) -> Result<R, MemoryError> {
        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        let block = blocks
            .get_mut(&id.0)
            .ok_or_else(|| MemoryError(format!("unknown allocation {}", id.0)))?;
        f(block)
    }
}

fn span(len: usize, offset: usize, bytes: usize) -> Result<std::ops::Range<usize>, MemoryError> {
    match offset.checked_add(bytes) {
        Some(end) if end <= len => Ok(offset..end),
        _ => Err(MemoryError(format!(
            "access at {offset} of {bytes} bytes exceeds allocation of {len} bytes"
        ))),
    }
}

impl DeviceMemory for HostStagedMemory {
    fn name(&self) -> &str {
        "host-staged"
    }

    fn allocate(&self, bytes: usize) -> Result<AllocationId, MemoryError> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, vec![0; bytes]);
        Ok(AllocationId(id))
    }

    fn write(&self, id: AllocationId, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        self.with_block(id, |block| {
            let range = span(block.len(), offset, data.len())?;
            block[range].copy_from_slice(data);
            Ok(())
        })
    }

    fn read(&self, id: AllocationId, offset: usize, out: &mut [u8]) -> Result<(), MemoryError> {
        self.with_block(id, |block| {
            let range = span(block.len(), offset, out.len())?;
            out.copy_from_slice(&block[range]);
            Ok(())
        })
    }

    fn copy(
        &self,
        src: AllocationId,
        src_offset: usize,
        dst: AllocationId,
        dst_offset: usize,
        bytes: usize,
    ) -> Result<(), MemoryError> {
        let mut staged = vec![0; bytes];
        self.read(src, src_offset, &mut staged)?;
        self.write(dst, dst_offset, &staged)
    }

    fn free(&self, id: AllocationId) {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id.0);
    }
}
