//! Accelerator emulated in host memory.
//!
//! Every device allocation is an aligned host allocation, work issued on a queue executes
//! immediately. All copies are range checked against live allocations of the named device,
//! so misuse of device affinity shows up as errors instead of corrupted memory.

use std::{
    alloc::Layout,
    collections::BTreeMap,
    ptr::{self, NonNull},
};

use super::{DevicePtr, DeviceProps, Driver, EventHandle, PoolHandle, QueueHandle};
use crate::{
    error::{BackendError, ErrorStatus},
    mutex::Mutex,
    DeviceId,
};

const ALLOCATION_ALIGNMENT: usize = 256;
/// Fresh device memory is filled with this so reads of uninitialized bytes are recognizable
pub const UNINITIALIZED_BYTE: u8 = 0xCD;

#[derive(Debug, Clone)]
pub struct EmulatedConfig {
    pub devices: usize,
    /// Memory of each device in bytes
    pub memory: usize,
    /// When false, page locked host allocations fail
    pub pinned_host: bool,
    pub peer_access: bool,
}

impl Default for EmulatedConfig {
    fn default() -> Self {
        Self { devices: 0, memory: 1 << 30, pinned_host: true, peer_access: true }
    }
}

impl EmulatedConfig {
    pub fn with_devices(devices: usize) -> Self {
        Self { devices, ..Self::default() }
    }
}

/// Bookkeeping of one emulated device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub live_allocations: usize,
    pub total_allocations: usize,
    pub bytes_in_use: usize,
    /// Bytes held by the device including blocks cached in pools
    pub bytes_reserved: usize,
    /// Peer copies issued from this device
    pub peer_copies: usize,
    /// Pool allocations served from a previously freed block
    pub pool_reuses: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Device(DeviceId),
    Pool(DeviceId, PoolHandle),
    PinnedHost,
}

impl Owner {
    fn device(self) -> Option<DeviceId> {
        match self {
            Owner::Device(d) | Owner::Pool(d, _) => Some(d),
            Owner::PinnedHost => None,
        }
    }
}

#[derive(Debug)]
struct Allocation {
    ptr: NonNull<u8>,
    layout: Layout,
    owner: Owner,
    live: bool,
}

unsafe impl Send for Allocation {}

#[derive(Debug)]
struct EmulatedPool {
    device: DeviceId,
    reuse: bool,
    cached: Vec<u64>,
}

#[derive(Debug, Default)]
struct State {
    allocations: BTreeMap<u64, Allocation>,
    pools: BTreeMap<PoolHandle, EmulatedPool>,
    queues: BTreeMap<QueueHandle, DeviceId>,
    events: BTreeMap<EventHandle, DeviceId>,
    next_handle: u64,
    stats: Vec<DeviceStats>,
}

#[derive(Debug)]
pub struct EmulatedDriver {
    config: EmulatedConfig,
    state: Mutex<State>,
}

impl EmulatedDriver {
    pub fn new(config: &EmulatedConfig) -> EmulatedDriver {
        tracing::debug!(target: "xpu::device", devices = config.devices, memory = config.memory, "emulated driver");
        EmulatedDriver {
            config: config.clone(),
            state: Mutex::new(State {
                stats: vec![DeviceStats::default(); config.devices],
                next_handle: 1,
                ..State::default()
            }),
        }
    }

    pub fn stats(&self, device: DeviceId) -> DeviceStats {
        self.state.lock().stats.get(device).copied().unwrap_or_default()
    }

    fn check_device(&self, device: DeviceId) -> Result<(), BackendError> {
        if device < self.config.devices {
            Ok(())
        } else {
            Err(BackendError::new(ErrorStatus::DeviceQuery, format!("no emulated device {device}")))
        }
    }
}

impl State {
    fn handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn check_queue(&self, device: DeviceId, queue: QueueHandle) -> Result<(), BackendError> {
        match self.queues.get(&queue) {
            Some(&d) if d == device => Ok(()),
            Some(&d) => Err(BackendError::new(
                ErrorStatus::QueueSync,
                format!("queue {} belongs to device {d}, not {device}", queue.0),
            )),
            None => Err(BackendError::new(ErrorStatus::QueueSync, format!("unknown queue {}", queue.0))),
        }
    }

    fn check_event(&self, device: DeviceId, event: EventHandle) -> Result<(), BackendError> {
        match self.events.get(&event) {
            Some(&d) if d == device => Ok(()),
            _ => Err(BackendError::new(
                ErrorStatus::Event,
                format!("event {} does not belong to device {device}", event.0),
            )),
        }
    }

    fn allocate(&mut self, owner: Owner, bytes: usize, capacity: usize) -> Result<u64, BackendError> {
        if let Some(device) = owner.device() {
            let reserved = self.stats[device].bytes_reserved;
            if reserved + bytes > capacity {
                return Err(BackendError::new(
                    ErrorStatus::MemoryAllocation,
                    format!("out of memory, {bytes} B requested, {} B free", capacity - reserved),
                ));
            }
        }
        let layout = Layout::from_size_align(bytes.max(1), ALLOCATION_ALIGNMENT)
            .map_err(|e| BackendError::new(ErrorStatus::MemoryAllocation, e.to_string()))?;
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })
            .ok_or_else(|| BackendError::new(ErrorStatus::MemoryAllocation, "host allocation failed"))?;
        if owner.device().is_some() {
            unsafe { ptr::write_bytes(ptr.as_ptr(), UNINITIALIZED_BYTE, layout.size()) };
        }
        let addr = ptr.as_ptr() as u64;
        self.allocations.insert(addr, Allocation { ptr, layout, owner, live: true });
        if let Some(device) = owner.device() {
            let stats = &mut self.stats[device];
            stats.live_allocations += 1;
            stats.total_allocations += 1;
            stats.bytes_in_use += layout.size();
            stats.bytes_reserved += layout.size();
        }
        Ok(addr)
    }

    fn release(&mut self, addr: u64) {
        if let Some(alloc) = self.allocations.remove(&addr) {
            if let Some(device) = alloc.owner.device() {
                let stats = &mut self.stats[device];
                if alloc.live {
                    stats.live_allocations -= 1;
                    stats.bytes_in_use -= alloc.layout.size();
                }
                stats.bytes_reserved -= alloc.layout.size();
            }
            unsafe { std::alloc::dealloc(alloc.ptr.as_ptr(), alloc.layout) };
        }
    }

    /// Host address of `bytes` bytes at `ptr`, which must lie inside one live allocation of `device`.
    fn resolve(&self, device: DeviceId, ptr: DevicePtr, bytes: usize) -> Result<*mut u8, BackendError> {
        let found = self.allocations.range(..=ptr.0).next_back();
        if let Some((&base, alloc)) = found {
            let end = base + alloc.layout.size() as u64;
            if alloc.live && alloc.owner.device() == Some(device) && ptr.0 + bytes as u64 <= end {
                return Ok(unsafe { alloc.ptr.as_ptr().add((ptr.0 - base) as usize) });
            }
        }
        Err(BackendError::new(
            ErrorStatus::MemoryCopy,
            format!("{bytes} B at {:#x} is not memory of device {device}", ptr.0),
        ))
    }
}

impl Drop for EmulatedDriver {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let leaked: Vec<u64> = state.allocations.keys().copied().collect();
        if !leaked.is_empty() {
            tracing::debug!(target: "xpu::memory", count = leaked.len(), "releasing allocations at driver teardown");
        }
        for addr in leaked {
            state.release(addr);
        }
    }
}

impl Driver for EmulatedDriver {
    fn name(&self) -> &str {
        "emulated"
    }

    fn device_count(&self) -> usize {
        self.config.devices
    }

    fn device_props(&self, device: DeviceId) -> Result<DeviceProps, BackendError> {
        self.check_device(device)?;
        Ok(DeviceProps {
            name: format!("Emulated Device {device}"),
            description: format!("Emulated accelerator {device} backed by host memory"),
            total_memory: self.config.memory,
            compute_capability: (0, 0),
            integrated: true,
        })
    }

    fn memory_info(&self, device: DeviceId) -> Result<(usize, usize), BackendError> {
        self.check_device(device)?;
        let reserved = self.state.lock().stats[device].bytes_reserved;
        Ok((self.config.memory - reserved, self.config.memory))
    }

    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> bool {
        self.config.peer_access && device != peer && device < self.config.devices && peer < self.config.devices
    }

    fn queue_create(&self, device: DeviceId) -> Result<QueueHandle, BackendError> {
        self.check_device(device)?;
        let mut state = self.state.lock();
        let queue = QueueHandle(state.handle());
        state.queues.insert(queue, device);
        Ok(queue)
    }

    fn queue_destroy(&self, device: DeviceId, queue: QueueHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check_queue(device, queue)?;
        state.queues.remove(&queue);
        Ok(())
    }

    fn queue_synchronize(&self, device: DeviceId, queue: QueueHandle) -> Result<(), BackendError> {
        self.state.lock().check_queue(device, queue)
    }

    fn event_create(&self, device: DeviceId) -> Result<EventHandle, BackendError> {
        self.check_device(device)?;
        let mut state = self.state.lock();
        let event = EventHandle(state.handle());
        state.events.insert(event, device);
        Ok(event)
    }

    fn event_record(&self, device: DeviceId, event: EventHandle, queue: QueueHandle) -> Result<(), BackendError> {
        let state = self.state.lock();
        state.check_event(device, event)?;
        state.check_queue(device, queue)
    }

    fn event_synchronize(&self, device: DeviceId, event: EventHandle) -> Result<(), BackendError> {
        self.state.lock().check_event(device, event)
    }

    fn queue_wait_event(
        &self,
        device: DeviceId,
        queue: QueueHandle,
        event_device: DeviceId,
        event: EventHandle,
    ) -> Result<(), BackendError> {
        let state = self.state.lock();
        state.check_queue(device, queue)?;
        state.check_event(event_device, event)
    }

    fn event_destroy(&self, device: DeviceId, event: EventHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check_event(device, event)?;
        state.events.remove(&event);
        Ok(())
    }

    fn alloc(&self, device: DeviceId, bytes: usize) -> Result<DevicePtr, BackendError> {
        self.check_device(device)?;
        let addr = self.state.lock().allocate(Owner::Device(device), bytes, self.config.memory)?;
        Ok(DevicePtr(addr))
    }

    fn free(&self, device: DeviceId, ptr: DevicePtr) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        match state.allocations.get(&ptr.0) {
            Some(alloc) if alloc.owner == Owner::Device(device) => {
                state.release(ptr.0);
                Ok(())
            }
            _ => Err(BackendError::new(
                ErrorStatus::MemoryDeallocation,
                format!("{:#x} was not allocated on device {device}", ptr.0),
            )),
        }
    }

    fn pool_create(&self, device: DeviceId, reuse_internal_dependencies: bool) -> Result<PoolHandle, BackendError> {
        self.check_device(device)?;
        let mut state = self.state.lock();
        let pool = PoolHandle(state.handle());
        state.pools.insert(pool, EmulatedPool { device, reuse: reuse_internal_dependencies, cached: Vec::new() });
        Ok(pool)
    }

    fn pool_destroy(&self, device: DeviceId, pool: PoolHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        match state.pools.get(&pool) {
            Some(p) if p.device == device => {}
            _ => {
                return Err(BackendError::new(
                    ErrorStatus::Deinitialization,
                    format!("pool {} does not belong to device {device}", pool.0),
                ))
            }
        }
        state.pools.remove(&pool);
        let owned: Vec<u64> = state
            .allocations
            .iter()
            .filter(|(_, a)| a.owner == Owner::Pool(device, pool))
            .map(|(&addr, _)| addr)
            .collect();
        for addr in owned {
            state.release(addr);
        }
        Ok(())
    }

    fn pool_alloc_async(
        &self,
        device: DeviceId,
        pool: PoolHandle,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<DevicePtr, BackendError> {
        let mut state = self.state.lock();
        state.check_queue(device, queue)?;
        let Some(p) = state.pools.get(&pool) else {
            return Err(BackendError::new(ErrorStatus::MemoryAllocation, format!("unknown pool {}", pool.0)));
        };
        if p.device != device {
            return Err(BackendError::new(
                ErrorStatus::MemoryAllocation,
                format!("pool {} belongs to device {}, not {device}", pool.0, p.device),
            ));
        }
        // best fit among cached blocks
        let best = p
            .cached
            .iter()
            .enumerate()
            .filter_map(|(i, addr)| {
                let size = state.allocations.get(addr)?.layout.size();
                (size >= bytes).then_some((size, i, *addr))
            })
            .min();
        if let Some((size, i, addr)) = best {
            if let Some(p) = state.pools.get_mut(&pool) {
                p.cached.swap_remove(i);
            }
            if let Some(alloc) = state.allocations.get_mut(&addr) {
                alloc.live = true;
            }
            let stats = &mut state.stats[device];
            stats.live_allocations += 1;
            stats.total_allocations += 1;
            stats.bytes_in_use += size;
            stats.pool_reuses += 1;
            return Ok(DevicePtr(addr));
        }
        let addr = state.allocate(Owner::Pool(device, pool), bytes, self.config.memory)?;
        Ok(DevicePtr(addr))
    }

    fn pool_free(&self, device: DeviceId, ptr: DevicePtr, queue: Option<QueueHandle>) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if let Some(queue) = queue {
            state.check_queue(device, queue)?;
        }
        let pool = match state.allocations.get(&ptr.0) {
            Some(Allocation { owner: Owner::Pool(d, pool), live: true, .. }) if *d == device => *pool,
            _ => {
                return Err(BackendError::new(
                    ErrorStatus::MemoryDeallocation,
                    format!("{:#x} is not a live pool allocation of device {device}", ptr.0),
                ))
            }
        };
        let reuse = state.pools.get(&pool).is_some_and(|p| p.reuse);
        if reuse {
            let size = match state.allocations.get_mut(&ptr.0) {
                Some(alloc) => {
                    alloc.live = false;
                    alloc.layout.size()
                }
                None => 0,
            };
            let stats = &mut state.stats[device];
            stats.live_allocations -= 1;
            stats.bytes_in_use -= size;
            if let Some(p) = state.pools.get_mut(&pool) {
                p.cached.push(ptr.0);
            }
        } else {
            state.release(ptr.0);
        }
        Ok(())
    }

    fn host_alloc_pinned(&self, bytes: usize) -> Result<*mut u8, BackendError> {
        if !self.config.pinned_host {
            return Err(BackendError::new(ErrorStatus::MemoryAllocation, "page locked memory is not available"));
        }
        let addr = self.state.lock().allocate(Owner::PinnedHost, bytes, 0)?;
        Ok(addr as *mut u8)
    }

    fn host_free_pinned(&self, ptr: *mut u8) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        match state.allocations.get(&(ptr as u64)) {
            Some(alloc) if alloc.owner == Owner::PinnedHost => {
                state.release(ptr as u64);
                Ok(())
            }
            _ => Err(BackendError::new(ErrorStatus::MemoryDeallocation, format!("{ptr:?} is not page locked memory"))),
        }
    }

    unsafe fn memcpy_htod_async(
        &self,
        device: DeviceId,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<(), BackendError> {
        let state = self.state.lock();
        state.check_queue(device, queue)?;
        if bytes == 0 {
            return Ok(());
        }
        let dst = state.resolve(device, dst, bytes)?;
        unsafe { ptr::copy(src, dst, bytes) };
        Ok(())
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        device: DeviceId,
        dst: *mut u8,
        src: DevicePtr,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<(), BackendError> {
        let state = self.state.lock();
        state.check_queue(device, queue)?;
        if bytes == 0 {
            return Ok(());
        }
        let src = state.resolve(device, src, bytes)?;
        unsafe { ptr::copy(src, dst, bytes) };
        Ok(())
    }

    fn memcpy_dtod_async(
        &self,
        device: DeviceId,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<(), BackendError> {
        let state = self.state.lock();
        state.check_queue(device, queue)?;
        if bytes == 0 {
            return Ok(());
        }
        let src = state.resolve(device, src, bytes)?;
        let dst = state.resolve(device, dst, bytes)?;
        unsafe { ptr::copy(src, dst, bytes) };
        Ok(())
    }

    fn memcpy_peer_async(
        &self,
        dst_device: DeviceId,
        dst: DevicePtr,
        src_device: DeviceId,
        src: DevicePtr,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<(), BackendError> {
        if !self.can_access_peer(src_device, dst_device) {
            return Err(BackendError::new(
                ErrorStatus::MemoryCopy,
                format!("device {src_device} has no peer access to device {dst_device}"),
            ));
        }
        let mut state = self.state.lock();
        state.check_queue(src_device, queue)?;
        if bytes == 0 {
            return Ok(());
        }
        let src = state.resolve(src_device, src, bytes)?;
        let dst = state.resolve(dst_device, dst, bytes)?;
        unsafe { ptr::copy_nonoverlapping(src, dst, bytes) };
        state.stats[src_device].peer_copies += 1;
        Ok(())
    }

    fn memset_async(
        &self,
        device: DeviceId,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<(), BackendError> {
        let state = self.state.lock();
        state.check_queue(device, queue)?;
        if bytes == 0 {
            return Ok(());
        }
        let dst = state.resolve(device, dst, bytes)?;
        unsafe { ptr::write_bytes(dst, value, bytes) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(devices: usize) -> EmulatedDriver {
        EmulatedDriver::new(&EmulatedConfig { memory: 1 << 20, ..EmulatedConfig::with_devices(devices) })
    }

    #[test]
    fn copies_are_range_checked() -> Result<(), BackendError> {
        let d = driver(2);
        let q0 = d.queue_create(0)?;
        let ptr = d.alloc(0, 64)?;
        let data = [7u8; 64];
        unsafe { d.memcpy_htod_async(0, ptr, data.as_ptr(), 64, q0)? };
        let mut out = [0u8; 64];
        unsafe { d.memcpy_dtoh_async(0, out.as_mut_ptr(), ptr, 64, q0)? };
        assert_eq!(out, data);
        // past the end of the allocation
        let err = unsafe { d.memcpy_htod_async(0, ptr.offset(200), data.as_ptr(), 64, q0) }.unwrap_err();
        assert_eq!(err.status, ErrorStatus::MemoryCopy);
        // memory of device 0 through device 1
        let q1 = d.queue_create(1)?;
        assert!(d.memset_async(1, ptr, 0, 8, q1).is_err());
        // queue of another device
        assert!(d.memset_async(0, ptr, 0, 8, q1).is_err());
        d.free(0, ptr)?;
        assert_eq!(d.stats(0).live_allocations, 0);
        Ok(())
    }

    #[test]
    fn capacity_is_enforced() -> Result<(), BackendError> {
        let d = driver(1);
        let _a = d.alloc(0, 1 << 19)?;
        let err = d.alloc(0, 1 << 20).unwrap_err();
        assert_eq!(err.status, ErrorStatus::MemoryAllocation);
        let (free, total) = d.memory_info(0)?;
        assert_eq!(total, 1 << 20);
        assert_eq!(free, 1 << 19);
        Ok(())
    }

    #[test]
    fn pool_reuses_freed_blocks() -> Result<(), BackendError> {
        let d = driver(1);
        let q = d.queue_create(0)?;
        let pool = d.pool_create(0, true)?;
        let a = d.pool_alloc_async(0, pool, 1000, q)?;
        d.pool_free(0, a, Some(q))?;
        let b = d.pool_alloc_async(0, pool, 512, q)?;
        assert_eq!(a, b);
        assert_eq!(d.stats(0).pool_reuses, 1);
        // plain free of a pool pointer is refused
        assert!(d.free(0, b).is_err());
        d.pool_destroy(0, pool)?;
        assert_eq!(d.stats(0).bytes_reserved, 0);

        let pool = d.pool_create(0, false)?;
        let a = d.pool_alloc_async(0, pool, 1000, q)?;
        d.pool_free(0, a, None)?;
        d.pool_alloc_async(0, pool, 1000, q)?;
        assert_eq!(d.stats(0).pool_reuses, 1);
        Ok(())
    }

    #[test]
    fn peer_copy_counts() -> Result<(), BackendError> {
        let d = driver(2);
        let q0 = d.queue_create(0)?;
        let a = d.alloc(0, 16)?;
        let b = d.alloc(1, 16)?;
        d.memset_async(0, a, 3, 16, q0)?;
        d.memcpy_peer_async(1, b, 0, a, 16, q0)?;
        assert_eq!(d.stats(0).peer_copies, 1);
        let q1 = d.queue_create(1)?;
        let mut out = [0u8; 16];
        unsafe { d.memcpy_dtoh_async(1, out.as_mut_ptr(), b, 16, q1)? };
        assert_eq!(out, [3; 16]);

        let no_peer = EmulatedDriver::new(&EmulatedConfig { peer_access: false, ..EmulatedConfig::with_devices(2) });
        let q = no_peer.queue_create(0)?;
        let a = no_peer.alloc(0, 16)?;
        let b = no_peer.alloc(1, 16)?;
        assert!(no_peer.memcpy_peer_async(1, b, 0, a, 16, q).is_err());
        Ok(())
    }
}
