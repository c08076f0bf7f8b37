//! CUDA driver api, loaded at runtime.

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]

use std::{
    collections::BTreeSet,
    ffi::{c_char, c_int, c_uint, c_void},
    ptr,
};

use libloading::Library;
use nanoserde::DeJson;

use super::{DevicePtr, DeviceProps, Driver, EventHandle, PoolHandle, QueueHandle};
use crate::{
    error::{BackendError, ErrorStatus},
    mutex::Mutex,
    DeviceId,
};

/// CUDA configuration
#[derive(Debug, Default, Clone, DeJson)]
pub struct CUDAConfig {
    /// Ordinals of devices to use, all devices when not set
    pub device_ids: Option<Vec<i32>>,
}

type CUdevice = c_int;
type CUdeviceptr = u64;
type CUcontext = *mut c_void;
type CUstream = *mut c_void;
type CUevent = *mut c_void;
type CUmemoryPool = *mut c_void;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CUresult(c_int);

impl CUresult {
    const SUCCESS: CUresult = CUresult(0);
    const ERROR_PEER_ACCESS_ALREADY_ENABLED: CUresult = CUresult(704);

    fn check(self, status: ErrorStatus) -> Result<(), BackendError> {
        if self == Self::SUCCESS {
            Ok(())
        } else {
            Err(BackendError::new(status, format!("CUresult {}", self.0)))
        }
    }
}

const CU_DEVICE_ATTRIBUTE_INTEGRATED: c_int = 18;
const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR: c_int = 75;
const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR: c_int = 76;
const CU_STREAM_NON_BLOCKING: c_uint = 1;
const CU_EVENT_DISABLE_TIMING: c_uint = 2;
const CU_MEMHOSTALLOC_PORTABLE: c_uint = 1;
const CU_MEM_ALLOCATION_TYPE_PINNED: c_int = 1;
const CU_MEM_LOCATION_TYPE_DEVICE: c_int = 1;
const CU_MEMPOOL_ATTR_REUSE_ALLOW_INTERNAL_DEPENDENCIES: c_int = 3;

#[repr(C)]
struct CUmemLocation {
    type_: c_int,
    id: c_int,
}

#[repr(C)]
struct CUmemPoolProps {
    allocType: c_int,
    handleTypes: c_int,
    location: CUmemLocation,
    win32SecurityAttributes: *mut c_void,
    maxSize: usize,
    usage: u16,
    reserved: [u8; 54],
}

struct CudaApi {
    cuDeviceGetName: unsafe extern "C" fn(*mut c_char, c_int, CUdevice) -> CUresult,
    cuDeviceTotalMem: unsafe extern "C" fn(*mut usize, CUdevice) -> CUresult,
    cuDeviceGetAttribute: unsafe extern "C" fn(*mut c_int, c_int, CUdevice) -> CUresult,
    cuDeviceCanAccessPeer: unsafe extern "C" fn(*mut c_int, CUdevice, CUdevice) -> CUresult,
    cuDevicePrimaryCtxRelease: unsafe extern "C" fn(CUdevice) -> CUresult,
    cuCtxSetCurrent: unsafe extern "C" fn(CUcontext) -> CUresult,
    cuCtxEnablePeerAccess: unsafe extern "C" fn(CUcontext, c_uint) -> CUresult,
    cuMemGetInfo: unsafe extern "C" fn(*mut usize, *mut usize) -> CUresult,
    cuStreamCreate: unsafe extern "C" fn(*mut CUstream, c_uint) -> CUresult,
    cuStreamDestroy: unsafe extern "C" fn(CUstream) -> CUresult,
    cuStreamSynchronize: unsafe extern "C" fn(CUstream) -> CUresult,
    cuStreamWaitEvent: unsafe extern "C" fn(CUstream, CUevent, c_uint) -> CUresult,
    cuEventCreate: unsafe extern "C" fn(*mut CUevent, c_uint) -> CUresult,
    cuEventRecord: unsafe extern "C" fn(CUevent, CUstream) -> CUresult,
    cuEventSynchronize: unsafe extern "C" fn(CUevent) -> CUresult,
    cuEventDestroy: unsafe extern "C" fn(CUevent) -> CUresult,
    cuMemAlloc: unsafe extern "C" fn(*mut CUdeviceptr, usize) -> CUresult,
    cuMemFree: unsafe extern "C" fn(CUdeviceptr) -> CUresult,
    cuMemPoolCreate: unsafe extern "C" fn(*mut CUmemoryPool, *const CUmemPoolProps) -> CUresult,
    cuMemPoolDestroy: unsafe extern "C" fn(CUmemoryPool) -> CUresult,
    cuMemPoolSetAttribute: unsafe extern "C" fn(CUmemoryPool, c_int, *mut c_void) -> CUresult,
    cuMemAllocFromPoolAsync: unsafe extern "C" fn(*mut CUdeviceptr, usize, CUmemoryPool, CUstream) -> CUresult,
    cuMemFreeAsync: unsafe extern "C" fn(CUdeviceptr, CUstream) -> CUresult,
    cuMemHostAlloc: unsafe extern "C" fn(*mut *mut c_void, usize, c_uint) -> CUresult,
    cuMemFreeHost: unsafe extern "C" fn(*mut c_void) -> CUresult,
    cuMemcpyHtoDAsync: unsafe extern "C" fn(CUdeviceptr, *const c_void, usize, CUstream) -> CUresult,
    cuMemcpyDtoHAsync: unsafe extern "C" fn(*mut c_void, CUdeviceptr, usize, CUstream) -> CUresult,
    cuMemcpyDtoDAsync: unsafe extern "C" fn(CUdeviceptr, CUdeviceptr, usize, CUstream) -> CUresult,
    cuMemcpyPeerAsync:
        unsafe extern "C" fn(CUdeviceptr, CUcontext, CUdeviceptr, CUcontext, usize, CUstream) -> CUresult,
    cuMemsetD8Async: unsafe extern "C" fn(CUdeviceptr, u8, usize, CUstream) -> CUresult,
}

struct CudaDevice {
    device: CUdevice,
    context: CUcontext,
    props: DeviceProps,
}

pub struct CudaDriver {
    api: CudaApi,
    devices: Vec<CudaDevice>,
    peers: Mutex<BTreeSet<(DeviceId, DeviceId)>>,
    // Keeps function pointers valid, dropped last
    _cuda: Library,
}

unsafe impl Send for CudaDriver {}
unsafe impl Sync for CudaDriver {}

impl std::fmt::Debug for CudaDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaDriver").field("devices", &self.devices.iter().map(|d| &d.props.name).collect::<Vec<_>>()).finish()
    }
}

fn symbol<T: Copy>(lib: &Library, name: &[u8]) -> Result<T, BackendError> {
    match unsafe { lib.get::<T>(name) } {
        Ok(sym) => Ok(*sym),
        Err(e) => Err(BackendError::new(
            ErrorStatus::DyLibNotFound,
            format!("{} not found in cuda runtime: {e}", String::from_utf8_lossy(&name[..name.len() - 1])),
        )),
    }
}

impl CudaDriver {
    pub fn new(config: &CUDAConfig) -> Result<CudaDriver, BackendError> {
        let cuda_paths = ["/lib/x86_64-linux-gnu/libcuda.so", "/lib64/libcuda.so", "/usr/lib/libcuda.so", "libcuda.so.1"];
        let cuda = cuda_paths.iter().find_map(|path| unsafe { Library::new(path) }.ok());
        let Some(cuda) = cuda else {
            return Err(BackendError::new(ErrorStatus::DyLibNotFound, "CUDA runtime not found."));
        };
        let cuInit: unsafe extern "C" fn(c_uint) -> CUresult = symbol(&cuda, b"cuInit\0")?;
        let cuDriverGetVersion: unsafe extern "C" fn(*mut c_int) -> CUresult =
            symbol(&cuda, b"cuDriverGetVersion\0")?;
        let cuDeviceGetCount: unsafe extern "C" fn(*mut c_int) -> CUresult = symbol(&cuda, b"cuDeviceGetCount\0")?;
        let cuDeviceGet: unsafe extern "C" fn(*mut CUdevice, c_int) -> CUresult = symbol(&cuda, b"cuDeviceGet\0")?;
        let cuDevicePrimaryCtxRetain: unsafe extern "C" fn(*mut CUcontext, CUdevice) -> CUresult =
            symbol(&cuda, b"cuDevicePrimaryCtxRetain\0")?;
        let api = CudaApi {
            cuDeviceGetName: symbol(&cuda, b"cuDeviceGetName\0")?,
            cuDeviceTotalMem: symbol(&cuda, b"cuDeviceTotalMem_v2\0")?,
            cuDeviceGetAttribute: symbol(&cuda, b"cuDeviceGetAttribute\0")?,
            cuDeviceCanAccessPeer: symbol(&cuda, b"cuDeviceCanAccessPeer\0")?,
            cuDevicePrimaryCtxRelease: symbol(&cuda, b"cuDevicePrimaryCtxRelease_v2\0")?,
            cuCtxSetCurrent: symbol(&cuda, b"cuCtxSetCurrent\0")?,
            cuCtxEnablePeerAccess: symbol(&cuda, b"cuCtxEnablePeerAccess\0")?,
            cuMemGetInfo: symbol(&cuda, b"cuMemGetInfo_v2\0")?,
            cuStreamCreate: symbol(&cuda, b"cuStreamCreate\0")?,
            cuStreamDestroy: symbol(&cuda, b"cuStreamDestroy_v2\0")?,
            cuStreamSynchronize: symbol(&cuda, b"cuStreamSynchronize\0")?,
            cuStreamWaitEvent: symbol(&cuda, b"cuStreamWaitEvent\0")?,
            cuEventCreate: symbol(&cuda, b"cuEventCreate\0")?,
            cuEventRecord: symbol(&cuda, b"cuEventRecord\0")?,
            cuEventSynchronize: symbol(&cuda, b"cuEventSynchronize\0")?,
            cuEventDestroy: symbol(&cuda, b"cuEventDestroy_v2\0")?,
            cuMemAlloc: symbol(&cuda, b"cuMemAlloc_v2\0")?,
            cuMemFree: symbol(&cuda, b"cuMemFree_v2\0")?,
            cuMemPoolCreate: symbol(&cuda, b"cuMemPoolCreate\0")?,
            cuMemPoolDestroy: symbol(&cuda, b"cuMemPoolDestroy\0")?,
            cuMemPoolSetAttribute: symbol(&cuda, b"cuMemPoolSetAttribute\0")?,
            cuMemAllocFromPoolAsync: symbol(&cuda, b"cuMemAllocFromPoolAsync\0")?,
            cuMemFreeAsync: symbol(&cuda, b"cuMemFreeAsync\0")?,
            cuMemHostAlloc: symbol(&cuda, b"cuMemHostAlloc\0")?,
            cuMemFreeHost: symbol(&cuda, b"cuMemFreeHost\0")?,
            cuMemcpyHtoDAsync: symbol(&cuda, b"cuMemcpyHtoDAsync_v2\0")?,
            cuMemcpyDtoHAsync: symbol(&cuda, b"cuMemcpyDtoHAsync_v2\0")?,
            cuMemcpyDtoDAsync: symbol(&cuda, b"cuMemcpyDtoDAsync_v2\0")?,
            cuMemcpyPeerAsync: symbol(&cuda, b"cuMemcpyPeerAsync\0")?,
            cuMemsetD8Async: symbol(&cuda, b"cuMemsetD8Async\0")?,
        };

        unsafe { cuInit(0) }.check(ErrorStatus::Initialization)?;
        let mut driver_version = 0;
        unsafe { cuDriverGetVersion(&mut driver_version) }.check(ErrorStatus::Initialization)?;
        let mut num_devices = 0;
        unsafe { cuDeviceGetCount(&mut num_devices) }.check(ErrorStatus::DeviceEnumeration)?;
        tracing::debug!(
            target: "xpu::device",
            "cuda driver {}.{}, {num_devices} devices",
            driver_version / 1000,
            (driver_version % 1000) / 10
        );
        let ordinals: Vec<c_int> = match &config.device_ids {
            Some(ids) => ids.iter().copied().filter(|&i| i >= 0 && i < num_devices).collect(),
            None => (0..num_devices).collect(),
        };

        let mut devices = Vec::with_capacity(ordinals.len());
        for ordinal in ordinals {
            let mut device = 0;
            unsafe { cuDeviceGet(&mut device, ordinal) }.check(ErrorStatus::DeviceEnumeration)?;
            let mut context = ptr::null_mut();
            unsafe { cuDevicePrimaryCtxRetain(&mut context, device) }.check(ErrorStatus::Initialization)?;
            let mut name = [0 as c_char; 256];
            unsafe { (api.cuDeviceGetName)(name.as_mut_ptr(), 256, device) }.check(ErrorStatus::DeviceQuery)?;
            let name: String = name
                .iter()
                .take_while(|&&c| c != 0)
                .map(|&c| c as u8 as char)
                .collect();
            let mut total_memory = 0;
            unsafe { (api.cuDeviceTotalMem)(&mut total_memory, device) }.check(ErrorStatus::DeviceQuery)?;
            let attribute = |attr| -> Result<c_int, BackendError> {
                let mut value = 0;
                unsafe { (api.cuDeviceGetAttribute)(&mut value, attr, device) }.check(ErrorStatus::DeviceQuery)?;
                Ok(value)
            };
            let major = attribute(CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
            let minor = attribute(CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;
            let integrated = attribute(CU_DEVICE_ATTRIBUTE_INTEGRATED)? != 0;
            tracing::debug!(target: "xpu::device", ordinal, %name, total_memory, "compute {major}.{minor}");
            devices.push(CudaDevice {
                device,
                context,
                props: DeviceProps {
                    description: name.clone(),
                    name,
                    total_memory,
                    compute_capability: (major, minor),
                    integrated,
                },
            });
        }
        Ok(CudaDriver { api, devices, peers: Mutex::new(BTreeSet::new()), _cuda: cuda })
    }

    fn set_current(&self, device: DeviceId) -> Result<&CudaDevice, BackendError> {
        let Some(dev) = self.devices.get(device) else {
            return Err(BackendError::new(ErrorStatus::DeviceQuery, format!("no cuda device {device}")));
        };
        unsafe { (self.api.cuCtxSetCurrent)(dev.context) }.check(ErrorStatus::Initialization)?;
        Ok(dev)
    }

    /// Peer access is enabled lazily the first time a pair copies.
    fn enable_peer(&self, src: DeviceId, dst: DeviceId) -> Result<(), BackendError> {
        let mut peers = self.peers.lock();
        if peers.contains(&(src, dst)) {
            return Ok(());
        }
        let peer_context = self.set_current(dst)?.context;
        self.set_current(src)?;
        let res = unsafe { (self.api.cuCtxEnablePeerAccess)(peer_context, 0) };
        if res != CUresult::ERROR_PEER_ACCESS_ALREADY_ENABLED {
            res.check(ErrorStatus::MemoryCopy)?;
        }
        peers.insert((src, dst));
        Ok(())
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        for dev in &self.devices {
            if let Err(e) = unsafe { (self.api.cuDevicePrimaryCtxRelease)(dev.device) }.check(ErrorStatus::Deinitialization) {
                tracing::warn!(target: "xpu::device", "{e}");
            }
        }
    }
}

impl Driver for CudaDriver {
    fn name(&self) -> &str {
        "cuda"
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device_props(&self, device: DeviceId) -> Result<DeviceProps, BackendError> {
        self.devices
            .get(device)
            .map(|d| d.props.clone())
            .ok_or_else(|| BackendError::new(ErrorStatus::DeviceQuery, format!("no cuda device {device}")))
    }

    fn memory_info(&self, device: DeviceId) -> Result<(usize, usize), BackendError> {
        self.set_current(device)?;
        let (mut free, mut total) = (0, 0);
        unsafe { (self.api.cuMemGetInfo)(&mut free, &mut total) }.check(ErrorStatus::DeviceQuery)?;
        Ok((free, total))
    }

    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> bool {
        let (Some(a), Some(b)) = (self.devices.get(device), self.devices.get(peer)) else {
            return false;
        };
        let mut can = 0;
        unsafe { (self.api.cuDeviceCanAccessPeer)(&mut can, a.device, b.device) }.check(ErrorStatus::DeviceQuery).is_ok()
            && can != 0
    }

    fn queue_create(&self, device: DeviceId) -> Result<QueueHandle, BackendError> {
        self.set_current(device)?;
        let mut stream = ptr::null_mut();
        unsafe { (self.api.cuStreamCreate)(&mut stream, CU_STREAM_NON_BLOCKING) }.check(ErrorStatus::QueueSync)?;
        Ok(QueueHandle(stream as u64))
    }

    fn queue_destroy(&self, device: DeviceId, queue: QueueHandle) -> Result<(), BackendError> {
        self.set_current(device)?;
        unsafe { (self.api.cuStreamDestroy)(queue.0 as CUstream) }.check(ErrorStatus::QueueSync)
    }

    fn queue_synchronize(&self, device: DeviceId, queue: QueueHandle) -> Result<(), BackendError> {
        self.set_current(device)?;
        unsafe { (self.api.cuStreamSynchronize)(queue.0 as CUstream) }.check(ErrorStatus::QueueSync)
    }

    fn event_create(&self, device: DeviceId) -> Result<EventHandle, BackendError> {
        self.set_current(device)?;
        let mut event = ptr::null_mut();
        unsafe { (self.api.cuEventCreate)(&mut event, CU_EVENT_DISABLE_TIMING) }.check(ErrorStatus::Event)?;
        Ok(EventHandle(event as u64))
    }

    fn event_record(&self, device: DeviceId, event: EventHandle, queue: QueueHandle) -> Result<(), BackendError> {
        self.set_current(device)?;
        unsafe { (self.api.cuEventRecord)(event.0 as CUevent, queue.0 as CUstream) }.check(ErrorStatus::Event)
    }

    fn event_synchronize(&self, device: DeviceId, event: EventHandle) -> Result<(), BackendError> {
        self.set_current(device)?;
        unsafe { (self.api.cuEventSynchronize)(event.0 as CUevent) }.check(ErrorStatus::Event)
    }

    fn queue_wait_event(
        &self,
        device: DeviceId,
        queue: QueueHandle,
        _event_device: DeviceId,
        event: EventHandle,
    ) -> Result<(), BackendError> {
        self.set_current(device)?;
        unsafe { (self.api.cuStreamWaitEvent)(queue.0 as CUstream, event.0 as CUevent, 0) }.check(ErrorStatus::Event)
    }

    fn event_destroy(&self, device: DeviceId, event: EventHandle) -> Result<(), BackendError> {
        self.set_current(device)?;
        unsafe { (self.api.cuEventDestroy)(event.0 as CUevent) }.check(ErrorStatus::Event)
    }

    fn alloc(&self, device: DeviceId, bytes: usize) -> Result<DevicePtr, BackendError> {
        self.set_current(device)?;
        let mut ptr = 0;
        unsafe { (self.api.cuMemAlloc)(&mut ptr, bytes) }.check(ErrorStatus::MemoryAllocation)?;
        Ok(DevicePtr(ptr))
    }

    fn free(&self, device: DeviceId, ptr: DevicePtr) -> Result<(), BackendError> {
        self.set_current(device)?;
        unsafe { (self.api.cuMemFree)(ptr.0) }.check(ErrorStatus::MemoryDeallocation)
    }

    fn pool_create(&self, device: DeviceId, reuse_internal_dependencies: bool) -> Result<PoolHandle, BackendError> {
        let dev = self.set_current(device)?;
        let props = CUmemPoolProps {
            allocType: CU_MEM_ALLOCATION_TYPE_PINNED,
            handleTypes: 0,
            location: CUmemLocation { type_: CU_MEM_LOCATION_TYPE_DEVICE, id: dev.device },
            win32SecurityAttributes: ptr::null_mut(),
            maxSize: 0,
            usage: 0,
            reserved: [0; 54],
        };
        let mut pool = ptr::null_mut();
        unsafe { (self.api.cuMemPoolCreate)(&mut pool, &props) }.check(ErrorStatus::Initialization)?;
        let mut reuse: c_int = reuse_internal_dependencies.into();
        unsafe {
            (self.api.cuMemPoolSetAttribute)(
                pool,
                CU_MEMPOOL_ATTR_REUSE_ALLOW_INTERNAL_DEPENDENCIES,
                (&mut reuse as *mut c_int).cast(),
            )
        }
        .check(ErrorStatus::Initialization)?;
        Ok(PoolHandle(pool as u64))
    }

    fn pool_destroy(&self, device: DeviceId, pool: PoolHandle) -> Result<(), BackendError> {
        self.set_current(device)?;
        unsafe { (self.api.cuMemPoolDestroy)(pool.0 as CUmemoryPool) }.check(ErrorStatus::Deinitialization)
    }

    fn pool_alloc_async(
        &self,
        device: DeviceId,
        pool: PoolHandle,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<DevicePtr, BackendError> {
        self.set_current(device)?;
        let mut ptr = 0;
        unsafe { (self.api.cuMemAllocFromPoolAsync)(&mut ptr, bytes, pool.0 as CUmemoryPool, queue.0 as CUstream) }
            .check(ErrorStatus::MemoryAllocation)?;
        Ok(DevicePtr(ptr))
    }

    fn pool_free(&self, device: DeviceId, ptr: DevicePtr, queue: Option<QueueHandle>) -> Result<(), BackendError> {
        self.set_current(device)?;
        match queue {
            Some(queue) => unsafe { (self.api.cuMemFreeAsync)(ptr.0, queue.0 as CUstream) },
            // cuMemFree synchronizes the device before releasing stream ordered memory
            None => unsafe { (self.api.cuMemFree)(ptr.0) },
        }
        .check(ErrorStatus::MemoryDeallocation)
    }

    fn host_alloc_pinned(&self, bytes: usize) -> Result<*mut u8, BackendError> {
        self.set_current(0)?;
        let mut ptr = ptr::null_mut();
        unsafe { (self.api.cuMemHostAlloc)(&mut ptr, bytes, CU_MEMHOSTALLOC_PORTABLE) }
            .check(ErrorStatus::MemoryAllocation)?;
        Ok(ptr.cast())
    }

    fn host_free_pinned(&self, ptr: *mut u8) -> Result<(), BackendError> {
        unsafe { (self.api.cuMemFreeHost)(ptr.cast()) }.check(ErrorStatus::MemoryDeallocation)
    }

    unsafe fn memcpy_htod_async(
        &self,
        device: DeviceId,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<(), BackendError> {
        self.set_current(device)?;
        unsafe { (self.api.cuMemcpyHtoDAsync)(dst.0, src.cast(), bytes, queue.0 as CUstream) }
            .check(ErrorStatus::MemoryCopy)
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        device: DeviceId,
        dst: *mut u8,
        src: DevicePtr,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<(), BackendError> {
        self.set_current(device)?;
        unsafe { (self.api.cuMemcpyDtoHAsync)(dst.cast(), src.0, bytes, queue.0 as CUstream) }
            .check(ErrorStatus::MemoryCopy)
    }

    fn memcpy_dtod_async(
        &self,
        device: DeviceId,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<(), BackendError> {
        self.set_current(device)?;
        unsafe { (self.api.cuMemcpyDtoDAsync)(dst.0, src.0, bytes, queue.0 as CUstream) }.check(ErrorStatus::MemoryCopy)
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
        self.enable_peer(src_device, dst_device)?;
        let dst_context = self.set_current(dst_device)?.context;
        let src_context = self.set_current(src_device)?.context;
        unsafe { (self.api.cuMemcpyPeerAsync)(dst.0, dst_context, src.0, src_context, bytes, queue.0 as CUstream) }
            .check(ErrorStatus::MemoryCopy)
    }

    fn memset_async(
        &self,
        device: DeviceId,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        queue: QueueHandle,
    ) -> Result<(), BackendError> {
        self.set_current(device)?;
        unsafe { (self.api.cuMemsetD8Async)(dst.0, value, bytes, queue.0 as CUstream) }.check(ErrorStatus::MemoryCopy)
    }
}
