//! Device discovery.
//!
//! A [`Registry`] enumerates the devices of one driver and hands out a [`DeviceDesc`] per
//! device. Most users take the process wide one from [`registry`], tests construct their own
//! with an emulated driver.

use std::sync::Arc;

use crate::{
    backend::Backend,
    buffer::{device::DeviceBufferType, host::HostBufferType, split::SplitBufferType, BufferType},
    config::BackendConfig,
    context::{DeviceContext, Event},
    driver::{initialize_driver, Driver},
    error::{BackendError, ErrorStatus, XpuError},
    graph::Graph,
    mutex::Mutex,
    provider::{ComputeProvider, ReferenceProvider},
    split::{SplitLayout, TensorSplit},
    supports,
    tensor::{Tensor, TensorId},
    DeviceId, MAX_DEVICES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Accelerator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    pub async_: bool,
    pub host_buffer: bool,
    pub buffer_from_host_ptr: bool,
    pub events: bool,
}

/// One device as seen by the host runtime.
#[derive(Debug)]
pub struct DeviceDesc {
    device: DeviceId,
    name: String,
    description: String,
    driver: Arc<dyn Driver>,
    provider: Arc<dyn ComputeProvider>,
    config: Arc<BackendConfig>,
    buffer_type: Arc<DeviceBufferType>,
    host_buffer_type: Arc<HostBufferType>,
}

impl DeviceDesc {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Free and total memory in bytes
    pub fn memory(&self) -> Result<(usize, usize), BackendError> {
        self.driver.memory_info(self.device).map_err(|e| e.on_device(self.device))
    }

    pub fn device_type(&self) -> DeviceType {
        DeviceType::Accelerator
    }

    pub fn props(&self) -> DeviceCaps {
        DeviceCaps { async_: true, host_buffer: true, buffer_from_host_ptr: false, events: true }
    }

    /// New backend instance with its own queue, compute handle and pool on this device.
    pub fn init_backend(&self) -> Result<Backend, BackendError> {
        let context =
            DeviceContext::new(self.driver.clone(), self.provider.clone(), self.config.clone(), self.device)?;
        verbose!(self.config.debug_dev(), "xpu::device", device = self.device, "initialized backend {}", self.name);
        Ok(Backend::new(self.name.clone(), context))
    }

    pub fn buffer_type(&self) -> Arc<DeviceBufferType> {
        self.buffer_type.clone()
    }

    pub fn host_buffer_type(&self) -> Arc<HostBufferType> {
        self.host_buffer_type.clone()
    }

    pub fn supports_op(&self, graph: &Graph, node: TensorId) -> bool {
        supports::supports_op(graph, node, self.device)
    }

    pub fn supports_buft(&self, buft: &dyn BufferType) -> bool {
        supports::supports_buft(buft.kind(), self.device)
    }

    pub fn offload_op(&self, tensor: &Tensor) -> bool {
        supports::offload_op(tensor, self.config.offload_min_batch)
    }

    pub fn event_new(&self) -> Result<Event, BackendError> {
        Event::new(self.driver.clone(), self.device)
    }

    pub fn event_free(&self, event: Event) {
        debug_assert_eq!(event.device(), self.device);
        drop(event);
    }

    pub fn event_synchronize(&self, event: &Event) -> Result<(), BackendError> {
        event.synchronize()
    }
}

/// Devices of one driver, enumerated once.
#[derive(Debug)]
pub struct Registry {
    /// `None` when no driver could be loaded
    driver: Option<Arc<dyn Driver>>,
    config: Arc<BackendConfig>,
    /// Queues for buffer transfers, `None` without devices
    transfer: Option<Arc<DeviceContext>>,
    devices: Vec<Arc<DeviceDesc>>,
    split_types: Mutex<Vec<Arc<SplitBufferType>>>,
}

impl Registry {
    pub fn new(
        driver: Arc<dyn Driver>,
        provider: Arc<dyn ComputeProvider>,
        config: BackendConfig,
    ) -> Result<Registry, XpuError> {
        let config = Arc::new(config);
        let mut count = driver.device_count();
        if count > MAX_DEVICES {
            tracing::warn!(target: "xpu::device", "{count} devices found, using the first {MAX_DEVICES}");
            count = MAX_DEVICES;
        }
        let transfer = if count > 0 {
            Some(Arc::new(DeviceContext::new(driver.clone(), provider.clone(), config.clone(), 0)?))
        } else {
            None
        };
        let mut devices = Vec::with_capacity(count);
        for device in 0..count {
            let Some(transfer) = &transfer else { break };
            let props = driver.device_props(device).map_err(|e| e.on_device(device))?;
            verbose!(
                config.debug_dev(),
                "xpu::device",
                device,
                name = %props.name,
                memory = props.total_memory,
                compute_capability = ?props.compute_capability,
                integrated = props.integrated,
                "found device"
            );
            devices.push(Arc::new(DeviceDesc {
                device,
                name: format!("XPU{device}"),
                description: props.name,
                driver: driver.clone(),
                provider: provider.clone(),
                config: config.clone(),
                buffer_type: Arc::new(DeviceBufferType::new(device, props.total_memory, transfer.clone())),
                host_buffer_type: Arc::new(HostBufferType::new(transfer.clone())),
            }));
        }
        tracing::debug!(target: "xpu::device", driver = driver.name(), devices = count, "registry initialized");
        Ok(Registry { driver: Some(driver), config, transfer, devices, split_types: Mutex::new(Vec::new()) })
    }

    /// Registry of the driver selected by `config` with the reference provider.
    /// Without a usable driver it has no devices.
    pub fn from_config(config: BackendConfig) -> Registry {
        let provider: Arc<dyn ComputeProvider> = Arc::new(ReferenceProvider);
        let registry = initialize_driver(&config)
            .map_err(XpuError::from)
            .and_then(|driver| Registry::new(driver, provider, config.clone()));
        match registry {
            Ok(registry) => registry,
            Err(e) => {
                tracing::warn!(target: "xpu::device", "no devices available: {e}");
                Registry {
                    driver: None,
                    config: Arc::new(config),
                    transfer: None,
                    devices: Vec::new(),
                    split_types: Mutex::new(Vec::new()),
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        "XPU"
    }

    pub fn driver(&self) -> Option<&Arc<dyn Driver>> {
        self.driver.as_ref()
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, index: usize) -> Result<&Arc<DeviceDesc>, XpuError> {
        self.devices.get(index).ok_or(XpuError::NoDevice(index))
    }

    pub fn devices(&self) -> &[Arc<DeviceDesc>] {
        &self.devices
    }

    /// Extension functions exported to the host runtime, there are none yet.
    pub fn proc_address(&self, _name: &str) -> Option<fn()> {
        None
    }

    /// Split buffer type for per device `weights`. Empty weights use the configured split,
    /// or an equal split. Identical splits share one buffer type.
    pub fn split_buffer_type(&self, weights: &[f32]) -> Result<Arc<SplitBufferType>, XpuError> {
        let Some(transfer) = &self.transfer else {
            return Err(BackendError::new(ErrorStatus::DeviceEnumeration, "split buffers need at least one device").into());
        };
        let weights = match (weights, &self.config.tensor_split) {
            ([], Some(configured)) => configured.as_slice(),
            _ => weights,
        };
        let layout =
            SplitLayout { split: TensorSplit::from_weights(weights, self.device_count())?, rounding: self.config.row_rounding };
        let mut cache = self.split_types.lock();
        if let Some(buft) = cache.iter().find(|b| *b.layout() == layout) {
            return Ok(buft.clone());
        }
        verbose!(self.config.debug_mem(), "xpu::memory", fractions = ?layout.split.fractions(), "new split buffer type");
        let buft = Arc::new(SplitBufferType::new(layout, transfer.clone()));
        cache.push(buft.clone());
        Ok(buft)
    }
}

static REGISTRY: Mutex<Option<&'static Registry>> = Mutex::new(None);

/// Process wide registry, enumerated on first call from [`BackendConfig::load`].
/// It lives until the process exits.
pub fn registry() -> &'static Registry {
    let mut registry = REGISTRY.lock();
    if let Some(registry) = *registry {
        return registry;
    }
    let new: &'static Registry = Box::leak(Box::new(Registry::from_config(BackendConfig::load())));
    *registry = Some(new);
    new
}
