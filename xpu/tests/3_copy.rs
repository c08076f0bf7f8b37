use std::sync::Arc;

use xpu::{
    copy::{plan, CopyMode, CopyNegotiator, CopyPath, Placement},
    driver::EmulatedDriver,
    BackendConfig, BufferType, DType, ErrorStatus, Graph, ReferenceProvider, Registry, TensorAllocator, TensorId,
    XpuError,
};

fn setup(config: BackendConfig) -> Result<(Arc<EmulatedDriver>, Registry), XpuError> {
    let driver = Arc::new(EmulatedDriver::new(&config.emulated));
    let registry = Registry::new(driver.clone(), Arc::new(ReferenceProvider), config)?;
    Ok((driver, registry))
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 37 % 251) as u8).collect()
}

/// Binds a fresh `[64]` f32 tensor to a new buffer on `device`.
fn device_tensor(registry: &Registry, g: &mut Graph, device: usize) -> Result<TensorId, XpuError> {
    let t = g.tensor(DType::F32, &[64]);
    let buffer = Arc::new(registry.device(device)?.buffer_type().alloc_buffer(256)?);
    TensorAllocator::new(buffer).alloc(g, t)?;
    Ok(t)
}

fn read(g: &Graph, t: TensorId) -> Result<Vec<u8>, XpuError> {
    let mut out = vec![0u8; g[t].nbytes()];
    if let Some(buffer) = &g[t].buffer {
        buffer.get_tensor(&g[t], &mut out, 0)?;
    }
    Ok(out)
}

#[test]
fn plan_table() {
    assert_eq!(plan(Placement::Device(1), Placement::Device(1), false), CopyPath::SameDevice(1));
    assert_eq!(plan(Placement::Device(0), Placement::Device(1), true), CopyPath::PeerToPeer { src: 0, dst: 1 });
    assert_eq!(plan(Placement::Device(0), Placement::Device(1), false), CopyPath::Refused);
    assert_eq!(plan(Placement::Host, Placement::Device(2), false), CopyPath::HostToDevice(2));
    assert_eq!(plan(Placement::Device(2), Placement::Host, false), CopyPath::DeviceToHost(2));
    assert_eq!(plan(Placement::Split, Placement::Device(0), true), CopyPath::Refused);
    assert_eq!(plan(Placement::Device(0), Placement::Split, true), CopyPath::Refused);
}

#[test]
fn same_device_copy_is_exact() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let mut g = Graph::new();
    let src = device_tensor(&registry, &mut g, 0)?;
    let dst = device_tensor(&registry, &mut g, 0)?;
    let data = pattern(256);
    if let Some(buffer) = &g[src].buffer {
        buffer.set_tensor(&g[src], &data, 0)?;
    }
    let copied = g[dst].buffer.as_ref().map(|b| b.cpy_tensor(&g[src], &g[dst])).transpose()?;
    assert_eq!(copied, Some(true));
    assert_eq!(read(&g, dst)?, data);
    Ok(())
}

#[cfg(feature = "peer_copy")]
#[test]
fn peer_copy_between_devices() -> Result<(), XpuError> {
    let (driver, registry) = setup(BackendConfig::emulated(2))?;
    let mut g = Graph::new();
    let src = device_tensor(&registry, &mut g, 0)?;
    let dst = device_tensor(&registry, &mut g, 1)?;
    let data = pattern(256);
    if let Some(buffer) = &g[src].buffer {
        buffer.set_tensor(&g[src], &data, 0)?;
    }
    let copied = g[dst].buffer.as_ref().map(|b| b.cpy_tensor(&g[src], &g[dst])).transpose()?;
    assert_eq!(copied, Some(true));
    assert_eq!(read(&g, dst)?, data);
    assert_eq!(driver.stats(0).peer_copies, 1);
    Ok(())
}

#[test]
fn disabled_peer_copy_is_refused() -> Result<(), XpuError> {
    let mut config = BackendConfig::emulated(2);
    config.peer_copy = false;
    let (driver, registry) = setup(config)?;
    let mut g = Graph::new();
    let src = device_tensor(&registry, &mut g, 0)?;
    let dst = device_tensor(&registry, &mut g, 1)?;
    if let Some(buffer) = &g[dst].buffer {
        buffer.clear(0x11)?;
    }
    let copied = g[dst].buffer.as_ref().map(|b| b.cpy_tensor(&g[src], &g[dst])).transpose()?;
    assert_eq!(copied, Some(false));
    assert_eq!(read(&g, dst)?, vec![0x11; 256]);
    assert_eq!(driver.stats(0).peer_copies, 0);
    Ok(())
}

#[test]
fn host_paths_complete_before_returning() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let device = registry.device(0)?;
    let backend = device.init_backend()?;
    let mut g = Graph::new();
    let on_device = device_tensor(&registry, &mut g, 0)?;
    let on_host = g.tensor(DType::F32, &[64]);
    let host_buffer = Arc::new(device.host_buffer_type().alloc_buffer(256)?);
    TensorAllocator::new(host_buffer.clone()).alloc(&mut g, on_host)?;

    let data = pattern(256);
    host_buffer.set_tensor(&g[on_host], &data, 0)?;
    let negotiator = CopyNegotiator::new(backend.context());
    assert!(negotiator.copy_tensor(&g[on_host], &g[on_device], CopyMode::Async)?);
    assert_eq!(read(&g, on_device)?, data);

    host_buffer.clear(0)?;
    // the host buffer itself pulls from device memory
    assert!(host_buffer.cpy_tensor(&g[on_device], &g[on_host])?);
    assert_eq!(read(&g, on_host)?, data);
    Ok(())
}

#[test]
fn copies_need_matching_sizes() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let backend = registry.device(0)?.init_backend()?;
    let mut g = Graph::new();
    let src = device_tensor(&registry, &mut g, 0)?;
    let small = g.tensor(DType::F32, &[16]);
    let buffer = Arc::new(registry.device(0)?.buffer_type().alloc_buffer(64)?);
    TensorAllocator::new(buffer).alloc(&mut g, small)?;
    let unbound = g.tensor(DType::F32, &[64]);

    let negotiator = CopyNegotiator::new(backend.context());
    let err = negotiator.copy_tensor(&g[src], &g[small], CopyMode::Sync).unwrap_err();
    assert_eq!(err.status, ErrorStatus::InvalidTensor);
    let err = negotiator.copy_tensor(&g[src], &g[unbound], CopyMode::Sync).unwrap_err();
    assert_eq!(err.status, ErrorStatus::InvalidTensor);
    Ok(())
}

#[test]
fn cross_backend_async_copy() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(2))?;
    let b0 = registry.device(0)?.init_backend()?;
    let b1 = registry.device(1)?.init_backend()?;
    let mut g = Graph::new();
    let src = device_tensor(&registry, &mut g, 0)?;
    let dst = device_tensor(&registry, &mut g, 1)?;
    let data = pattern(256);
    unsafe { b0.set_tensor_async(&g[src], &data, 0)? };
    b0.synchronize()?;

    // tensors must live on the backends' own devices
    assert!(!b1.cpy_tensor_async(&b0, &g[src], &g[dst])?);
    let copied = b0.cpy_tensor_async(&b1, &g[src], &g[dst])?;
    assert_eq!(copied, cfg!(feature = "peer_copy"));
    if copied {
        b1.synchronize()?;
        let mut out = vec![0u8; 256];
        unsafe { b1.get_tensor_async(&g[dst], &mut out, 0)? };
        b1.synchronize()?;
        assert_eq!(out, data);
    }

    let err = unsafe { b1.set_tensor_async(&g[src], &data, 0) }.unwrap_err();
    assert_eq!(err.status, ErrorStatus::InvalidBuffer);
    Ok(())
}
