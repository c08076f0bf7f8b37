//! Per device execution resources, created lazily.

use std::sync::Arc;

use crate::{
    config::BackendConfig,
    driver::{check_device, Driver, EventHandle, QueueHandle},
    error::{BackendError, ErrorStatus},
    mutex::Mutex,
    pool::MemoryPool,
    provider::{ComputeHandle, ComputeProvider},
    DeviceId,
};

/// Command queue of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queue {
    device: DeviceId,
    handle: QueueHandle,
}

impl Queue {
    pub(crate) fn new(device: DeviceId, handle: QueueHandle) -> Queue {
        Queue { device, handle }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle
    }
}

/// Marker placed on a queue. Other queues, including queues of other devices, can wait for it.
#[derive(Debug)]
pub struct Event {
    device: DeviceId,
    handle: EventHandle,
    driver: Arc<dyn Driver>,
}

impl Event {
    pub(crate) fn new(driver: Arc<dyn Driver>, device: DeviceId) -> Result<Event, BackendError> {
        let handle = driver.event_create(device).map_err(|e| e.on_device(device))?;
        Ok(Event { device, handle, driver })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Records the current end of `queue`, which must belong to this event's device.
    pub fn record(&self, queue: &Queue) -> Result<(), BackendError> {
        debug_assert_eq!(queue.device, self.device, "event recorded on queue of another device");
        self.driver.event_record(self.device, self.handle, queue.handle).map_err(|e| e.on_device(self.device))
    }

    /// Work issued on `queue` after this call starts once the recorded work completed.
    pub fn wait(&self, queue: &Queue) -> Result<(), BackendError> {
        self.driver
            .queue_wait_event(queue.device, queue.handle, self.device, self.handle)
            .map_err(|e| e.on_device(queue.device))
    }

    /// Blocks the calling thread until the recorded work completed.
    pub fn synchronize(&self) -> Result<(), BackendError> {
        self.driver.event_synchronize(self.device, self.handle).map_err(|e| e.on_device(self.device))
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if let Err(e) = self.driver.event_destroy(self.device, self.handle) {
            tracing::warn!(target: "xpu::device", "{}", e.on_device(self.device));
        }
    }
}

#[derive(Debug, Default)]
struct DeviceSlot {
    queue: Option<Queue>,
    handle: Option<ComputeHandle>,
    pool: Option<Arc<MemoryPool>>,
}

/// Queue, compute handle and memory pool of every device, each created on first use.
///
/// `device` is the main device, the one a backend instance dispatches to. Resources of
/// other devices are created only when split tensors or cross device copies need them.
/// Dropping the context synchronizes and releases everything it created.
#[derive(Debug)]
pub struct DeviceContext {
    device: DeviceId,
    driver: Arc<dyn Driver>,
    provider: Arc<dyn ComputeProvider>,
    config: Arc<BackendConfig>,
    slots: Mutex<Vec<DeviceSlot>>,
}

impl DeviceContext {
    pub fn new(
        driver: Arc<dyn Driver>,
        provider: Arc<dyn ComputeProvider>,
        config: Arc<BackendConfig>,
        device: DeviceId,
    ) -> Result<DeviceContext, BackendError> {
        check_device(driver.as_ref(), device)?;
        let slots = (0..driver.device_count()).map(|_| DeviceSlot::default()).collect();
        Ok(DeviceContext { device, driver, provider, config, slots: Mutex::new(slots) })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn provider(&self) -> &Arc<dyn ComputeProvider> {
        &self.provider
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn slot_queue(&self, slot: &mut DeviceSlot, device: DeviceId) -> Result<Queue, BackendError> {
        if let Some(queue) = slot.queue {
            return Ok(queue);
        }
        let handle = self.driver.queue_create(device).map_err(|e| e.on_device(device))?;
        verbose!(self.config.debug_dev(), "xpu::device", device, queue = handle.0, "created queue");
        let queue = Queue::new(device, handle);
        slot.queue = Some(queue);
        Ok(queue)
    }

    fn with_slot<T>(
        &self,
        device: DeviceId,
        f: impl FnOnce(&mut DeviceSlot) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut slots = self.slots.lock();
        let available = slots.len();
        let Some(slot) = slots.get_mut(device) else {
            return Err(BackendError::new(
                ErrorStatus::DeviceQuery,
                format!("device {device} out of range, {available} devices available"),
            ));
        };
        f(slot)
    }

    pub fn queue(&self, device: DeviceId) -> Result<Queue, BackendError> {
        self.with_slot(device, |slot| self.slot_queue(slot, device))
    }

    pub fn handle(&self, device: DeviceId) -> Result<ComputeHandle, BackendError> {
        self.with_slot(device, |slot| {
            if let Some(handle) = slot.handle {
                return Ok(handle);
            }
            let queue = self.slot_queue(slot, device)?;
            let handle = self.provider.create_handle(device, &queue).map_err(|e| e.on_device(device))?;
            verbose!(self.config.debug_dev(), "xpu::device", device, provider = self.provider.name(), "created compute handle");
            slot.handle = Some(handle);
            Ok(handle)
        })
    }

    pub fn pool(&self, device: DeviceId) -> Result<Arc<MemoryPool>, BackendError> {
        self.with_slot(device, |slot| {
            if let Some(pool) = &slot.pool {
                return Ok(pool.clone());
            }
            let pool = Arc::new(MemoryPool::new(
                self.driver.clone(),
                device,
                self.config.pool_reuse_internal_dependencies,
                self.config.debug_mem(),
            )?);
            slot.pool = Some(pool.clone());
            Ok(pool)
        })
    }

    /// Blocks until all work on `device`'s queue completed. Nothing to wait for if the queue
    /// was never created.
    pub fn synchronize(&self, device: DeviceId) -> Result<(), BackendError> {
        let queue = self.with_slot(device, |slot| Ok(slot.queue))?;
        match queue {
            Some(queue) => self.driver.queue_synchronize(device, queue.handle).map_err(|e| e.on_device(device)),
            None => Ok(()),
        }
    }

    /// Devices whose queue was created by this context
    pub fn touched_devices(&self) -> Vec<DeviceId> {
        self.slots.lock().iter().enumerate().filter(|(_, s)| s.queue.is_some()).map(|(d, _)| d).collect()
    }

    pub fn synchronize_all(&self) -> Result<(), BackendError> {
        for device in self.touched_devices() {
            self.synchronize(device)?;
        }
        Ok(())
    }

    pub fn new_event(&self, device: DeviceId) -> Result<Event, BackendError> {
        Event::new(self.driver.clone(), device)
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        for (device, slot) in slots.iter_mut().enumerate() {
            if let Some(queue) = slot.queue {
                if let Err(e) = self.driver.queue_synchronize(device, queue.handle) {
                    tracing::warn!(target: "xpu::device", "{}", e.on_device(device));
                }
            }
            slot.pool = None;
            if let Some(handle) = slot.handle.take() {
                if let Err(e) = self.provider.destroy_handle(device, handle) {
                    tracing::warn!(target: "xpu::device", "{}", e.on_device(device));
                }
            }
            if let Some(queue) = slot.queue.take() {
                verbose!(self.config.debug_dev(), "xpu::device", device, queue = queue.handle.0, "destroying queue");
                if let Err(e) = self.driver.queue_destroy(device, queue.handle) {
                    tracing::warn!(target: "xpu::device", "{}", e.on_device(device));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        driver::{EmulatedConfig, EmulatedDriver},
        provider::ReferenceProvider,
    };

    fn context(devices: usize) -> Result<DeviceContext, BackendError> {
        let driver = Arc::new(EmulatedDriver::new(&EmulatedConfig::with_devices(devices)));
        DeviceContext::new(driver, Arc::new(ReferenceProvider), Arc::new(BackendConfig::emulated(devices)), 0)
    }

    #[test]
    fn resources_are_created_once() -> Result<(), BackendError> {
        let ctx = context(3)?;
        assert!(ctx.touched_devices().is_empty());
        let q = ctx.queue(2)?;
        assert_eq!(q, ctx.queue(2)?);
        assert_eq!(q.device(), 2);
        ctx.handle(1)?;
        assert_eq!(ctx.touched_devices(), vec![1, 2]);
        let p = ctx.pool(1)?;
        assert!(Arc::ptr_eq(&p, &ctx.pool(1)?));
        ctx.synchronize(0)?;
        ctx.synchronize_all()?;
        assert!(ctx.queue(3).is_err());
        Ok(())
    }

    #[test]
    fn cross_device_events() -> Result<(), BackendError> {
        let ctx = context(2)?;
        let event = ctx.new_event(0)?;
        event.record(&ctx.queue(0)?)?;
        event.wait(&ctx.queue(1)?)?;
        event.synchronize()?;
        Ok(())
    }

    #[test]
    fn context_for_missing_device() {
        assert!(DeviceContext::new(
            Arc::new(EmulatedDriver::new(&EmulatedConfig::with_devices(1))),
            Arc::new(ReferenceProvider),
            Arc::new(BackendConfig::emulated(1)),
            1,
        )
        .is_err());
    }
}
