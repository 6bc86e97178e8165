//! GPU device memory through WGPU.
//!
//! Each allocation is a `wgpu` storage buffer. Host reads go through a mapped staging
//! buffer; writes are queued with `Queue::write_buffer` and land before any command
//! submitted afterwards. The adapter is requested once per context using `pollster` to
//! block on WGPU's async initialisation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, mpsc};

use super::{AllocationId, DeviceMemory, MemoryError};

lazy_static::lazy_static! {
    static ref INSTANCE: ::wgpu::Instance = ::wgpu::Instance::default();
}

const ALIGN: u64 = ::wgpu::COPY_BUFFER_ALIGNMENT;

fn aligned(bytes: usize) -> u64 {
    (bytes as u64).div_ceil(ALIGN).max(1) * ALIGN
}

/// Device memory living in `wgpu` storage buffers.
#[derive(Debug)]
pub struct WgpuMemory {
    device: ::wgpu::Device,
    queue: ::wgpu::Queue,
    next: AtomicU64,
    buffers: Mutex<HashMap<u64, ::wgpu::Buffer>>,
}

impl WgpuMemory {
    /// Selects the default adapter and creates a device and queue on it.
    pub fn new() -> Result<Self, MemoryError> {
        let adapter = pollster::block_on(
            INSTANCE.request_adapter(&::wgpu::RequestAdapterOptions::default()),
        )
        .map_err(|err| MemoryError(format!("adapter error: {err}")))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&::wgpu::DeviceDescriptor {
            label: Some("sigma_core"),
            required_features: ::wgpu::Features::empty(),
            required_limits: ::wgpu::Limits::default(),
            memory_hints: ::wgpu::MemoryHints::Performance,
            trace: ::wgpu::Trace::default(),
        }))
        .map_err(|err| MemoryError(format!("device error: {err}")))?;

        Ok(Self {
            device,
            queue,
            next: AtomicU64::new(0),
            buffers: Mutex::new(HashMap::new()),
        })
    }

    fn with_buffer<R>(
        &self,
        id: AllocationId,
        f: impl FnOnce(&::wgpu::Buffer) -> Result<R, MemoryError>,
    ) -> Result<R, MemoryError> {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let buffer = buffers
            .get(&id.0)
            .ok_or_else(|| MemoryError(format!("unknown allocation {}", id.0)))?;
        f(buffer)
    }

    fn read_back(&self, src: &::wgpu::Buffer, offset: u64, out: &mut [u8]) -> Result<(), MemoryError> {
        let size = aligned(out.len());
        let staging = self.device.create_buffer(&::wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: ::wgpu::BufferUsages::MAP_READ | ::wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&::wgpu::CommandEncoderDescriptor {
                label: Some("read_back"),
            });
        encoder.copy_buffer_to_buffer(src, offset, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let (tx, rx) = mpsc::channel();
        let slice = staging.slice(..);
        slice.map_async(::wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(::wgpu::PollType::Wait)
            .map_err(|err| MemoryError(format!("poll failed: {err}")))?;
        rx.recv()
            .map_err(|_| MemoryError("map callback dropped".into()))?
            .map_err(|err| MemoryError(format!("map failed: {err}")))?;

        {
            let mapped = slice.get_mapped_range();
            out.copy_from_slice(&mapped[..out.len()]);
        }
        staging.unmap();
        staging.destroy();
        Ok(())
    }
}

impl DeviceMemory for WgpuMemory {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn allocate(&self, bytes: usize) -> Result<AllocationId, MemoryError> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let buffer = self.device.create_buffer(&::wgpu::BufferDescriptor {
            label: Some("ndarray"),
            size: aligned(bytes),
            usage: ::wgpu::BufferUsages::STORAGE
                | ::wgpu::BufferUsages::COPY_SRC
                | ::wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, buffer);
        Ok(AllocationId(id))
    }

    fn write(&self, id: AllocationId, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if data.is_empty() {
            return Ok(());
        }
        self.with_buffer(id, |buffer| {
            self.queue.write_buffer(buffer, offset as u64, data);
            Ok(())
        })
    }

    fn read(&self, id: AllocationId, offset: usize, out: &mut [u8]) -> Result<(), MemoryError> {
        if out.is_empty() {
            return Ok(());
        }
        self.with_buffer(id, |buffer| self.read_back(buffer, offset as u64, out))
    }

    fn copy(
        &self,
        src: AllocationId,
        src_offset: usize,
        dst: AllocationId,
        dst_offset: usize,
        bytes: usize,
    ) -> Result<(), MemoryError> {
        if bytes == 0 {
            return Ok(());
        }
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some(src), Some(dst)) = (buffers.get(&src.0), buffers.get(&dst.0)) else {
            return Err(MemoryError("unknown allocation in copy".into()));
        };
        let mut encoder = self
            .device
            .create_command_encoder(&::wgpu::CommandEncoderDescriptor {
                label: Some("device_copy"),
            });
        encoder.copy_buffer_to_buffer(src, src_offset as u64, dst, dst_offset as u64, bytes as u64);
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn free(&self, id: AllocationId) {
        if let Some(buffer) = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id.0)
        {
            buffer.destroy();
        }
    }
}
