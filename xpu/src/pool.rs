//! Stream ordered per device memory pool.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    context::Queue,
    driver::{DevicePtr, Driver, PoolHandle},
    error::{BackendError, ErrorStatus},
    mutex::Mutex,
    DeviceId,
};

/// Allocations are issued on a queue and usable by work submitted to that queue afterwards.
/// Freed blocks may be reused by later allocations on the same queue without extra synchronization
/// when the pool was created with internal dependency reuse.
#[derive(Debug)]
pub struct MemoryPool {
    device: DeviceId,
    handle: PoolHandle,
    driver: Arc<dyn Driver>,
    live: Mutex<BTreeMap<DevicePtr, usize>>,
    debug: bool,
}

impl MemoryPool {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        device: DeviceId,
        reuse_internal_dependencies: bool,
        debug: bool,
    ) -> Result<MemoryPool, BackendError> {
        let handle = driver.pool_create(device, reuse_internal_dependencies).map_err(|e| e.on_device(device))?;
        verbose!(debug, "xpu::memory", device, reuse_internal_dependencies, "created memory pool");
        Ok(MemoryPool { device, handle, driver, live: Mutex::new(BTreeMap::new()), debug })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    fn check_queue(&self, queue: &Queue) -> Result<(), BackendError> {
        if queue.device() == self.device {
            Ok(())
        } else {
            Err(BackendError::new(
                ErrorStatus::QueueSync,
                format!("queue of device {} used with memory pool of device {}", queue.device(), self.device),
            )
            .on_device(self.device))
        }
    }

    /// Allocation released automatically, ordered after work on `queue`.
    pub fn alloc(self: &Arc<Self>, size: usize, queue: &Queue) -> Result<PoolAlloc, BackendError> {
        let ptr = self.alloc_raw(size, queue)?;
        Ok(PoolAlloc { pool: self.clone(), ptr, size, queue: *queue })
    }

    pub fn alloc_raw(&self, size: usize, queue: &Queue) -> Result<DevicePtr, BackendError> {
        self.check_queue(queue)?;
        let ptr = self
            .driver
            .pool_alloc_async(self.device, self.handle, size.max(1), queue.handle())
            .map_err(|e| e.on_device(self.device))?;
        self.live.lock().insert(ptr, size);
        verbose!(self.debug, "xpu::memory", device = self.device, size, ptr = ptr.0, "pool alloc");
        Ok(ptr)
    }

    fn take(&self, ptr: DevicePtr) -> Result<usize, BackendError> {
        self.live.lock().remove(&ptr).ok_or_else(|| {
            BackendError::new(
                ErrorStatus::MemoryDeallocation,
                format!("{:#x} was not allocated from the memory pool of device {}", ptr.0, self.device),
            )
            .on_device(self.device)
        })
    }

    /// Synchronous release. All work using `ptr` must have completed.
    pub fn free(&self, ptr: DevicePtr) -> Result<(), BackendError> {
        let size = self.take(ptr)?;
        verbose!(self.debug, "xpu::memory", device = self.device, size, ptr = ptr.0, "pool free");
        self.driver.pool_free(self.device, ptr, None).map_err(|e| e.on_device(self.device))
    }

    /// Release ordered after work already issued on `queue`.
    pub fn free_async(&self, ptr: DevicePtr, queue: &Queue) -> Result<(), BackendError> {
        self.check_queue(queue)?;
        let size = self.take(ptr)?;
        verbose!(self.debug, "xpu::memory", device = self.device, size, ptr = ptr.0, "pool free async");
        self.driver.pool_free(self.device, ptr, Some(queue.handle())).map_err(|e| e.on_device(self.device))
    }

    /// Bytes currently handed out
    pub fn in_use(&self) -> usize {
        self.live.lock().values().sum()
    }

    pub fn live_allocations(&self) -> usize {
        self.live.lock().len()
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let live = self.live.lock().len();
        if live > 0 {
            tracing::warn!(target: "xpu::memory", device = self.device, live, "destroying memory pool with live allocations");
        }
        if let Err(e) = self.driver.pool_destroy(self.device, self.handle) {
            tracing::warn!(target: "xpu::memory", "{}", e.on_device(self.device));
        }
    }
}

/// Pool allocation freed on drop, ordered after work issued on its queue.
#[derive(Debug)]
pub struct PoolAlloc {
    pool: Arc<MemoryPool>,
    ptr: DevicePtr,
    size: usize,
    queue: Queue,
}

impl PoolAlloc {
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for PoolAlloc {
    fn drop(&mut self) {
        if let Err(e) = self.pool.free_async(self.ptr, &self.queue) {
            tracing::warn!(target: "xpu::memory", "{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{EmulatedConfig, EmulatedDriver};

    #[test]
    fn raii_release_and_cross_device_free() -> Result<(), BackendError> {
        let emulated = Arc::new(EmulatedDriver::new(&EmulatedConfig::with_devices(2)));
        let driver: Arc<dyn Driver> = emulated.clone();
        let q0 = Queue::new(0, driver.queue_create(0)?);
        let q1 = Queue::new(1, driver.queue_create(1)?);
        let pool0 = Arc::new(MemoryPool::new(driver.clone(), 0, true, false)?);
        let pool1 = Arc::new(MemoryPool::new(driver.clone(), 1, true, false)?);
        {
            let a = pool0.alloc(100, &q0)?;
            assert_eq!(a.size(), 100);
            assert_eq!(pool0.in_use(), 100);
        }
        assert_eq!(pool0.live_allocations(), 0);
        // reused block
        let b = pool0.alloc_raw(64, &q0)?;
        assert_eq!(emulated.stats(0).pool_reuses, 1);
        // queue of another device
        assert!(pool0.alloc_raw(64, &q1).is_err());
        // freeing through the pool of another device
        let err = pool1.free(b).unwrap_err();
        assert_eq!(err.status, ErrorStatus::MemoryDeallocation);
        assert_eq!(err.device, Some(1));
        pool0.free(b)?;
        Ok(())
    }
}
