//! Backend configuration.
//!
//! Read from `xpu/backend_config.json` in xdg config directories, then overridden by
//! environment variables `XPU_DEBUG`, `XPU_NO_PEER_COPY` and `XPU_EMULATED`.

use nanoserde::DeJson;

use crate::{
    driver::{CUDAConfig, EmulatedConfig},
    error::XpuError,
    DEFAULT_OFFLOAD_MIN_BATCH, DEFAULT_ROW_ROUNDING,
};

pub const CONFIG_FILE: &str = "xpu/backend_config.json";

/// Bits of `debug`
pub const DEBUG_DEV: u32 = 1;
pub const DEBUG_DISPATCH: u32 = 2;
pub const DEBUG_MEM: u32 = 4;

#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Allow direct device to device copies. Only effective with the `peer_copy` feature.
    pub peer_copy: bool,
    /// Split row boundaries are multiples of this
    pub row_rounding: i64,
    /// Minimum batch size for which `offload_op` recommends moving work to the device
    pub offload_min_batch: i64,
    /// Default split weights, equal split when unset
    pub tensor_split: Option<Vec<f32>>,
    pub pool_reuse_internal_dependencies: bool,
    pub debug: u32,
    pub emulated: EmulatedConfig,
    pub cuda: CUDAConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            peer_copy: true,
            row_rounding: DEFAULT_ROW_ROUNDING,
            offload_min_batch: DEFAULT_OFFLOAD_MIN_BATCH,
            tensor_split: None,
            pool_reuse_internal_dependencies: true,
            debug: 0,
            emulated: EmulatedConfig::default(),
            cuda: CUDAConfig::default(),
        }
    }
}

#[derive(Debug, Default, DeJson)]
struct EmulatedConfigFile {
    devices: Option<usize>,
    memory: Option<usize>,
    pinned_host: Option<bool>,
    peer_access: Option<bool>,
}

#[derive(Debug, Default, DeJson)]
struct ConfigFile {
    peer_copy: Option<bool>,
    row_rounding: Option<i64>,
    offload_min_batch: Option<i64>,
    tensor_split: Option<Vec<f32>>,
    pool_reuse_internal_dependencies: Option<bool>,
    debug: Option<u32>,
    emulated: Option<EmulatedConfigFile>,
    cuda: Option<CUDAConfig>,
}

impl BackendConfig {
    /// Emulated devices only, everything else default. Used by tests and demos.
    pub fn emulated(devices: usize) -> BackendConfig {
        BackendConfig { emulated: EmulatedConfig::with_devices(devices), ..BackendConfig::default() }
    }

    /// Parses config json, missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<BackendConfig, XpuError> {
        let file = ConfigFile::deserialize_json(json).map_err(|e| XpuError::config_error(format!("{e}")))?;
        let mut config = BackendConfig::default();
        if let Some(x) = file.peer_copy {
            config.peer_copy = x;
        }
        if let Some(x) = file.row_rounding {
            if x <= 0 {
                return Err(XpuError::config_error(format!("row_rounding must be positive, got {x}")));
            }
            config.row_rounding = x;
        }
        if let Some(x) = file.offload_min_batch {
            config.offload_min_batch = x;
        }
        config.tensor_split = file.tensor_split;
        if let Some(x) = file.pool_reuse_internal_dependencies {
            config.pool_reuse_internal_dependencies = x;
        }
        if let Some(x) = file.debug {
            config.debug = x;
        }
        if let Some(emulated) = file.emulated {
            let e = &mut config.emulated;
            e.devices = emulated.devices.unwrap_or(e.devices);
            e.memory = emulated.memory.unwrap_or(e.memory);
            e.pinned_host = emulated.pinned_host.unwrap_or(e.pinned_host);
            e.peer_access = emulated.peer_access.unwrap_or(e.peer_access);
        }
        if let Some(cuda) = file.cuda {
            config.cuda = cuda;
        }
        Ok(config)
    }

    /// Config file from xdg directories, then environment overrides.
    pub fn load() -> BackendConfig {
        let mut config = BackendConfig::default();
        if let Ok(dirs) = xdg::BaseDirectories::new() {
            if let Some(path) = dirs.find_config_file(CONFIG_FILE) {
                match std::fs::read_to_string(&path).map_err(XpuError::from).and_then(|s| Self::from_json(&s)) {
                    Ok(c) => {
                        tracing::debug!(target: "xpu::device", path = %path.display(), "loaded backend config");
                        config = c;
                    }
                    Err(e) => tracing::warn!(target: "xpu::device", path = %path.display(), "ignoring backend config: {e}"),
                }
            }
        }
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub(crate) fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(value) = var("XPU_DEBUG") {
            match value.parse() {
                Ok(d) => self.debug = d,
                Err(_) => tracing::warn!(target: "xpu::device", "XPU_DEBUG={value} is not a number"),
            }
        }
        if var("XPU_NO_PEER_COPY").is_some() {
            self.peer_copy = false;
        }
        if let Some(n) = var("XPU_EMULATED") {
            match n.parse() {
                Ok(n) => self.emulated.devices = n,
                Err(_) => tracing::warn!(target: "xpu::device", "XPU_EMULATED={n} is not a number"),
            }
        }
    }

    /// Peer copies need both the build feature and the runtime switch.
    pub fn peer_copy_enabled(&self) -> bool {
        cfg!(feature = "peer_copy") && self.peer_copy
    }

    pub fn debug_dev(&self) -> bool {
        self.debug & DEBUG_DEV != 0
    }

    pub fn debug_dispatch(&self) -> bool {
        self.debug & DEBUG_DISPATCH != 0
    }

    pub fn debug_mem(&self) -> bool {
        self.debug & DEBUG_MEM != 0
    }
}
