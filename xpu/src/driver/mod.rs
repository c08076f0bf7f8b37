//! Device runtime seam.
//!
//! Everything this crate needs from the vendor runtime goes through [`Driver`]. Copies, memsets
//! and pool allocations are queue ordered: they are issued on a queue and complete in issuance
//! order relative to other work on that queue.

pub mod cuda;
pub mod emulated;

use std::sync::Arc;

use crate::{
    config::BackendConfig,
    error::{BackendError, ErrorStatus},
    DeviceId,
};

pub use cuda::{CUDAConfig, CudaDriver};
pub use emulated::{DeviceStats, EmulatedConfig, EmulatedDriver};

/// Address in a device's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    #[must_use]
    pub fn offset(self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolHandle(pub u64);

#[derive(Debug, Clone, Default)]
pub struct DeviceProps {
    pub name: String,
    pub description: String,
    pub total_memory: usize,
    pub compute_capability: (i32, i32),
    pub integrated: bool,
}

pub trait Driver: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn device_count(&self) -> usize;
    fn device_props(&self, device: DeviceId) -> Result<DeviceProps, BackendError>;
    /// Free and total memory in bytes
    fn memory_info(&self, device: DeviceId) -> Result<(usize, usize), BackendError>;
    /// Whether `device` can directly read and write memory of `peer`
    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> bool;

    fn queue_create(&self, device: DeviceId) -> Result<QueueHandle, BackendError>;
    fn queue_destroy(&self, device: DeviceId, queue: QueueHandle) -> Result<(), BackendError>;
    /// Blocks until all work issued on `queue` completes
    fn queue_synchronize(&self, device: DeviceId, queue: QueueHandle) -> Result<(), BackendError>;

    fn event_create(&self, device: DeviceId) -> Result<EventHandle, BackendError>;
    fn event_record(&self, device: DeviceId, event: EventHandle, queue: QueueHandle) -> Result<(), BackendError>;
    fn event_synchronize(&self, device: DeviceId, event: EventHandle) -> Result<(), BackendError>;
    /// Work issued on `queue` after this call waits for `event`, which may belong to another device
    fn queue_wait_event(
        &self,
        device: DeviceId,
        queue: QueueHandle,
        event_device: DeviceId,
        event: EventHandle,
    ) -> Result<(), BackendError>;
    fn event_destroy(&self, device: DeviceId, event: EventHandle) -> Result<(), BackendError>;

    /// Synchronous device allocation
    fn alloc(&self, device: DeviceId, bytes: usize) -> Result<DevicePtr, BackendError>;
    fn free(&self, device: DeviceId, ptr: DevicePtr) -> Result<(), BackendError>;

    fn pool_create(&self, device: DeviceId, reuse_internal_dependencies: bool) -> Result<PoolHandle, BackendError>;
    fn pool_destroy(&self, device: DeviceId, pool: PoolHandle) -> Result<(), BackendError>;
    fn pool_alloc_async(
        &self,
        device: DeviceId,
        pool: PoolHandle,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<DevicePtr, BackendError>;
    /// Returns `ptr` to its pool. With `queue` the release is ordered after work on that queue,
    /// without it the release is immediate and the caller guarantees no work uses `ptr` anymore.
    fn pool_free(&self, device: DeviceId, ptr: DevicePtr, queue: Option<QueueHandle>) -> Result<(), BackendError>;

    /// Page locked host memory
    fn host_alloc_pinned(&self, bytes: usize) -> Result<*mut u8, BackendError>;
    fn host_free_pinned(&self, ptr: *mut u8) -> Result<(), BackendError>;

    /// # Safety
    /// `src` must be valid for reads of `bytes` until the queue is synchronized.
    unsafe fn memcpy_htod_async(
        &self,
        device: DeviceId,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<(), BackendError>;

    /// # Safety
    /// `dst` must be valid for writes of `bytes` until the queue is synchronized.
    unsafe fn memcpy_dtoh_async(
        &self,
        device: DeviceId,
        dst: *mut u8,
        src: DevicePtr,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<(), BackendError>;

    fn memcpy_dtod_async(
        &self,
        device: DeviceId,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<(), BackendError>;

    /// Direct copy between two devices, issued on a queue of `src_device`
    #[allow(clippy::too_many_arguments)]
    fn memcpy_peer_async(
        &self,
        dst_device: DeviceId,
        dst: DevicePtr,
        src_device: DeviceId,
        src: DevicePtr,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<(), BackendError>;

    fn memset_async(
        &self,
        device: DeviceId,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<(), BackendError>;
}

/// Picks the driver described by config. Emulated devices win when requested,
/// otherwise the cuda runtime is loaded.
pub fn initialize_driver(config: &BackendConfig) -> Result<Arc<dyn Driver>, BackendError> {
    if config.emulated.devices > 0 {
        return Ok(Arc::new(EmulatedDriver::new(&config.emulated)));
    }
    match CudaDriver::new(&config.cuda) {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(e) => {
            tracing::warn!(target: "xpu::device", "cuda runtime unavailable: {e}");
            Err(e)
        }
    }
}

pub(crate) fn check_device(driver: &dyn Driver, device: DeviceId) -> Result<(), BackendError> {
    if device < driver.device_count() {
        Ok(())
    } else {
        Err(BackendError::new(
            ErrorStatus::DeviceQuery,
            format!("device {device} out of range, {} devices available", driver.device_count()),
        ))
    }
}
