//! Device contexts and device-resident memory.
//!
//! A [`DeviceContext`] stands for one compute device (a GPU, or the host-staged stand-in).
//! It owns a [`DeviceMemory`] runtime and accounts for every live allocation, so tests and
//! workers can verify that no device memory is leaked once the arrays owning it are gone.
//!
//! Device access is a per-thread affinity: a thread must call
//! [`DeviceContext::bind_to_current_thread`] before it allocates, reads or writes device
//! memory, otherwise the operation fails with `ContextNotBound`. Freeing never requires a
//! binding, so dropping the last buffer of an allocation always releases it.
//!
//! ## Submodules
//!
//! - [`host`]: device memory resident in host RAM (always available)
//! - [`wgpu`] *(opt-in)*: real GPU buffers through `wgpu`

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::error::{Error, Result};

pub mod host;
#[cfg(feature = "wgpu")]
pub mod wgpu;

/// Identifier of a compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

/// Handle of one allocation inside a [`DeviceMemory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationId(pub u64);

/// Failure reported by a device memory runtime.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct MemoryError(pub String);

/// A device memory runtime.
///
/// Implementations hand out byte-addressed allocations. Offsets and lengths passed in are
/// always whole elements (multiples of 4 bytes).
pub trait DeviceMemory: Send + Sync + fmt::Debug {
    /// Human readable runtime name.
    fn name(&self) -> &str;

    /// Allocates `bytes` zeroed bytes.
    fn allocate(&self, bytes: usize) -> Result<AllocationId, MemoryError>;

    /// Writes `data` at `offset` bytes into `id`.
    fn write(&self, id: AllocationId, offset: usize, data: &[u8]) -> Result<(), MemoryError>;

    /// Reads `out.len()` bytes at `offset` from `id`.
    fn read(&self, id: AllocationId, offset: usize, out: &mut [u8]) -> Result<(), MemoryError>;

    /// Device-side copy between two allocations.
    fn copy(
        &self,
        src: AllocationId,
        src_offset: usize,
        dst: AllocationId,
        dst_offset: usize,
        bytes: usize,
    ) -> Result<(), MemoryError>;

    /// Releases `id`. Unknown ids are ignored.
    fn free(&self, id: AllocationId);
}

thread_local! {
    static BOUND_DEVICE: Cell<Option<DeviceId>> = const { Cell::new(None) };
}

/// One compute device and its memory runtime.
pub struct DeviceContext {
    id: DeviceId,
    memory: Box<dyn DeviceMemory>,
    live_allocations: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.id)
            .field("memory", &self.memory.name())
            .field("live_allocations", &self.live_allocations())
            .finish()
    }
}

impl DeviceContext {
    /// Creates a context over an arbitrary memory runtime.
    pub fn new(id: DeviceId, memory: impl DeviceMemory + 'static) -> Arc<Self> {
        Arc::new(Self {
            id,
            memory: Box::new(memory),
            live_allocations: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
        })
    }

    /// Creates a context whose device memory lives in host RAM.
    pub fn host_staged(id: DeviceId) -> Arc<Self> {
        Self::new(id, host::HostStagedMemory::default())
    }

    /// Creates a context backed by the default `wgpu` adapter.
    ///
    /// # Errors
    ///
    /// Fails with `Error::Device` when no adapter or device can be acquired.
    #[cfg(feature = "wgpu")]
    pub fn wgpu(id: DeviceId) -> Result<Arc<Self>> {
        let memory = self::wgpu::WgpuMemory::new().map_err(|err| Error::Device {
            device: id,
            message: err.0,
        })?;
        Ok(Self::new(id, memory))
    }

    /// The device identifier.
    pub const fn id(&self) -> DeviceId {
        self.id
    }

    /// Binds this device to the calling thread, replacing any previous binding.
    pub fn bind_to_current_thread(&self) {
        BOUND_DEVICE.with(|bound| bound.set(Some(self.id)));
        debug!(device = %self.id, thread = ?std::thread::current().id(), "bound device context");
    }

    /// Removes whatever device binding the calling thread has.
    pub fn unbind_current_thread() {
        BOUND_DEVICE.with(|bound| bound.set(None));
    }

    /// Whether this device is the one bound to the calling thread.
    pub fn is_bound_to_current_thread(&self) -> bool {
        BOUND_DEVICE.with(|bound| bound.get() == Some(self.id))
    }

    /// Fails with `ContextNotBound` unless this device is bound to the calling thread.
    pub fn ensure_bound(&self) -> Result<()> {
        if self.is_bound_to_current_thread() {
            Ok(())
        } else {
            Err(Error::ContextNotBound { device: self.id })
        }
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::Acquire)
    }

    /// Number of bytes held by live allocations.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    fn device_error(&self, err: MemoryError) -> Error {
        Error::Device {
            device: self.id,
            message: err.0,
        }
    }

    pub(crate) fn allocate(self: &Arc<Self>, bytes: usize) -> Result<DeviceAllocation> {
        self.ensure_bound()?;
        let id = self
            .memory
            .allocate(bytes)
            .map_err(|err| self.device_error(err))?;
        self.live_allocations.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
        debug!(device = %self.id, allocation = id.0, bytes, "allocated device memory");

        Ok(DeviceAllocation {
            context: Arc::clone(self),
            id,
            bytes,
        })
    }
}

/// An owned device allocation, freed on drop.
#[derive(Debug)]
pub struct DeviceAllocation {
    context: Arc<DeviceContext>,
    id: AllocationId,
    bytes: usize,
}

impl DeviceAllocation {
    /// The context this allocation lives on.
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    /// Size in bytes.
    pub const fn bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;
        self.context.ensure_bound()?;
        self.context
            .memory
            .read(self.id, offset, out)
            .map_err(|err| self.context.device_error(err))
    }

    pub(crate) fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        self.context.ensure_bound()?;
        self.context
            .memory
            .write(self.id, offset, data)
            .map_err(|err| self.context.device_error(err))
    }

    pub(crate) fn copy_to(
        &self,
        src_offset: usize,
        dst: &DeviceAllocation,
        dst_offset: usize,
        bytes: usize,
    ) -> Result<()> {
        if !Arc::ptr_eq(&self.context, &dst.context) {
            return Err(Error::BackendMismatch {
                expected: self.context.id.to_string(),
                found: dst.context.id.to_string(),
            });
        }
        self.check_range(src_offset, bytes)?;
        dst.check_range(dst_offset, bytes)?;
        self.context.ensure_bound()?;
        self.context
            .memory
            .copy(self.id, src_offset, dst.id, dst_offset, bytes)
            .map_err(|err| self.context.device_error(err))
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.bytes) {
            return Err(Error::IndexOutOfRange {
                index: vec![offset, offset.saturating_add(len)],
                bounds: vec![self.bytes],
            });
        }
        Ok(())
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.context.memory.free(self.id);
        self.context.live_allocations.fetch_sub(1, Ordering::AcqRel);
        self.context.live_bytes.fetch_sub(self.bytes, Ordering::AcqRel);
        debug!(device = %self.context.id, allocation = self.id.0, "freed device memory");
    }
}
