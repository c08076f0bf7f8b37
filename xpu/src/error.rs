use std::{fmt::Display, panic::Location};

use crate::DeviceId;

/// Enumeration representing the errors returned by registry and configuration entry points.
#[derive(Debug)]
pub enum XpuError {
    /// Error returned by the device runtime, memory pools, buffers or compute provider
    BackendError(BackendError),
    /// Error reading backend config
    ConfigError(Box<str>),
    /// Error from file operations
    IOError(std::io::Error),
    /// There is no device with given index
    NoDevice(usize),
}

impl XpuError {
    /// Config error
    #[track_caller]
    pub fn config_error(e: impl Into<String>) -> Self {
        let location = Location::caller();
        let mut e: String = e.into();
        e.push_str(&format!(", {}:{}:{}", location.file(), location.line(), location.column()));
        Self::ConfigError(e.into())
    }
}

impl Display for XpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            XpuError::BackendError(e) => f.write_fmt(format_args!("Backend {e}")),
            XpuError::ConfigError(e) => f.write_fmt(format_args!("Config {e}")),
            XpuError::IOError(e) => f.write_fmt(format_args!("IO {e}")),
            XpuError::NoDevice(i) => f.write_fmt(format_args!("No device with index {i}")),
        }
    }
}

impl std::error::Error for XpuError {}

impl From<std::io::Error> for XpuError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<BackendError> for XpuError {
    fn from(value: BackendError) -> Self {
        XpuError::BackendError(value)
    }
}

/// Error raised by any call into the device runtime or the compute provider.
///
/// Every error remembers the device it concerns (when known) and the call site that raised it,
/// so the fatal handler can report both.
#[derive(Debug, Clone)]
pub struct BackendError {
    pub status: ErrorStatus,
    pub context: Box<str>,
    pub device: Option<DeviceId>,
    pub location: &'static Location<'static>,
}

impl BackendError {
    #[track_caller]
    pub fn new(status: ErrorStatus, context: impl Into<Box<str>>) -> Self {
        Self { status, context: context.into(), device: None, location: Location::caller() }
    }

    /// Attaches device id, keeps the device that was attached first.
    #[must_use]
    pub fn on_device(mut self, device: DeviceId) -> Self {
        if self.device.is_none() {
            self.device = Some(device);
        }
        self
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(device) = self.device {
            f.write_fmt(format_args!("device {device}, "))?;
        }
        f.write_fmt(format_args!(
            "{:?}: {} at {}:{}:{}",
            self.status,
            self.context,
            self.location.file(),
            self.location.line(),
            self.location.column()
        ))
    }
}

impl std::error::Error for BackendError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    /// Dynamic library was not found on the disk
    DyLibNotFound,
    /// Backend initialization failure
    Initialization,
    /// Backend deinitialization failure
    Deinitialization,
    /// Failed to enumerate devices
    DeviceEnumeration,
    /// Failed to query device for information
    DeviceQuery,
    /// Failed to allocate memory
    MemoryAllocation,
    /// Failed to deallocate memory
    MemoryDeallocation,
    /// Failed to copy memory
    MemoryCopy,
    /// Failed to create, destroy or synchronize a queue
    QueueSync,
    /// Failed to create, record or wait on an event
    Event,
    /// Compute provider failed or refused to run a node
    Compute,
    /// Operation is not supported by this backend
    UnsupportedOperation,
    /// Tensor does not satisfy the requirements of the buffer it is bound to
    InvalidTensor,
    /// Buffer does not belong to the device or backend that was asked to use it
    InvalidBuffer,
}

/// Logs the error with its device and call site, then aborts the process.
///
/// This is the only place in the crate that terminates the process.
pub fn fatal(err: &BackendError) -> ! {
    let device = err.device.map_or_else(|| "unknown".to_string(), |d| d.to_string());
    let location =
        format!("{}:{}:{}", err.location.file(), err.location.line(), err.location.column());
    tracing::error!(device = %device, location = %location, status = ?err.status, "{}", err.context);
    eprintln!("xpu: fatal error on device {device} at {location}: {:?}: {}", err.status, err.context);
    std::process::abort()
}
