use std::sync::Arc;

use xpu::{
    driver::{emulated::UNINITIALIZED_BYTE, EmulatedDriver},
    BackendConfig, BufferKind, BufferType, BufferUsage, DType, Driver, ErrorStatus, Graph, ReferenceProvider,
    Registry, TensorAllocator, XpuError,
};

fn setup(config: BackendConfig) -> Result<(Arc<EmulatedDriver>, Registry), XpuError> {
    let driver = Arc::new(EmulatedDriver::new(&config.emulated));
    let registry = Registry::new(driver.clone(), Arc::new(ReferenceProvider), config)?;
    Ok((driver, registry))
}

fn bytes(data: &[f32]) -> Vec<u8> {
    data.iter().flat_map(|x| x.to_ne_bytes()).collect()
}

fn floats(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4).map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]])).collect()
}

#[test]
fn device_roundtrip_at_offset() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let buffer = Arc::new(registry.device(0)?.buffer_type().alloc_buffer(4096)?);
    assert_eq!(buffer.kind(), BufferKind::Device(0));
    assert!(!buffer.is_host());
    let mut g = Graph::new();
    let a = g.tensor(DType::F32, &[16]);
    let b = g.tensor(DType::F32, &[16]);
    let mut alloc = TensorAllocator::new(buffer.clone());
    alloc.alloc(&mut g, a)?;
    alloc.alloc(&mut g, b)?;
    assert_eq!(g[b].data.0 - g[a].data.0, 128);

    let data: Vec<f32> = (0..16).map(|i| i as f32 * 0.5).collect();
    buffer.set_tensor(&g[a], &bytes(&data), 0)?;
    buffer.set_tensor(&g[a], &bytes(&[-1.0, -2.0]), 8)?;
    let mut out = vec![0u8; 64];
    buffer.get_tensor(&g[a], &mut out, 0)?;
    let out = floats(&out);
    assert_eq!(&out[..2], &data[..2]);
    assert_eq!(&out[2..4], &[-1.0, -2.0]);
    assert_eq!(&out[4..], &data[4..]);

    let mut part = vec![0u8; 8];
    buffer.get_tensor(&g[a], &mut part, 56)?;
    assert_eq!(floats(&part), &data[14..]);
    Ok(())
}

#[test]
fn transfers_are_range_checked() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let buffer = Arc::new(registry.device(0)?.buffer_type().alloc_buffer(1024)?);
    let other = Arc::new(registry.device(0)?.buffer_type().alloc_buffer(1024)?);
    let mut g = Graph::new();
    let a = g.tensor(DType::F32, &[16]);
    let b = g.tensor(DType::F32, &[16]);
    TensorAllocator::new(buffer.clone()).alloc(&mut g, a)?;
    TensorAllocator::new(other).alloc(&mut g, b)?;

    let err = buffer.set_tensor(&g[a], &[0; 8], 60).unwrap_err();
    assert_eq!(err.status, ErrorStatus::InvalidTensor);
    let err = buffer.memset_tensor(&g[a], 0, 0, 65).unwrap_err();
    assert_eq!(err.status, ErrorStatus::InvalidTensor);
    // tensor of another buffer
    let err = buffer.set_tensor(&g[b], &[0; 4], 0).unwrap_err();
    assert_eq!(err.status, ErrorStatus::InvalidBuffer);
    Ok(())
}

#[test]
fn memset_and_clear() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let buffer = Arc::new(registry.device(0)?.buffer_type().alloc_buffer(256)?);
    let mut g = Graph::new();
    let a = g.tensor(DType::I8, &[32]);
    TensorAllocator::new(buffer.clone()).alloc(&mut g, a)?;
    buffer.clear(7)?;
    buffer.memset_tensor(&g[a], 1, 4, 4)?;
    let mut out = vec![0u8; 32];
    buffer.get_tensor(&g[a], &mut out, 0)?;
    assert_eq!(&out[..4], &[7; 4]);
    assert_eq!(&out[4..8], &[1; 4]);
    assert_eq!(&out[8..], &[7; 24]);
    Ok(())
}

#[test]
fn zero_sized_buffer() -> Result<(), XpuError> {
    let (driver, registry) = setup(BackendConfig::emulated(1))?;
    let buffer = registry.device(0)?.buffer_type().alloc_buffer(0)?;
    assert_eq!(buffer.size(), 0);
    assert!(!buffer.base().is_null());
    assert_eq!(driver.stats(0).live_allocations, 1);
    drop(buffer);
    assert_eq!(driver.stats(0).live_allocations, 0);
    Ok(())
}

#[test]
fn allocator_reports_exhaustion() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let buffer = Arc::new(registry.device(0)?.buffer_type().alloc_buffer(256)?);
    let mut g = Graph::new();
    let a = g.tensor(DType::F32, &[40]);
    let b = g.tensor(DType::F32, &[40]);
    let mut alloc = TensorAllocator::new(buffer);
    alloc.alloc(&mut g, a)?;
    let err = alloc.alloc(&mut g, b).unwrap_err();
    assert_eq!(err.status, ErrorStatus::MemoryAllocation);
    assert!(g[b].buffer.is_none());
    Ok(())
}

#[test]
fn views_share_storage() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let buffer = Arc::new(registry.device(0)?.buffer_type().alloc_buffer(1024)?);
    let mut g = Graph::new();
    let a = g.tensor(DType::F32, &[4, 4]);
    let row = g.view(a, &[4], &[], 32);
    let mut alloc = TensorAllocator::new(buffer.clone());
    alloc.alloc(&mut g, a)?;
    alloc.alloc(&mut g, row)?;
    assert_eq!(g[row].data, g[a].data.offset(32));

    let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
    buffer.set_tensor(&g[a], &bytes(&data), 0)?;
    let mut out = vec![0u8; 16];
    buffer.get_tensor(&g[row], &mut out, 0)?;
    assert_eq!(floats(&out), &[8.0, 9.0, 10.0, 11.0]);
    Ok(())
}

#[test]
fn quantized_padding_is_zeroed() -> Result<(), XpuError> {
    let (driver, registry) = setup(BackendConfig::emulated(1))?;
    let device = registry.device(0)?;
    let backend = device.init_backend()?;
    let queue = backend.context().queue(0)?;
    let padding_of = |usage: BufferUsage| -> Result<Vec<u8>, XpuError> {
        let buffer = Arc::new(device.buffer_type().alloc_buffer(1024)?.with_usage(usage));
        let mut g = Graph::new();
        let q = g.tensor(DType::Q8_0, &[64, 2]);
        assert_eq!(device.buffer_type().alloc_size(&g[q]), 136 + 476);
        TensorAllocator::new(buffer).alloc(&mut g, q)?;
        let mut out = vec![0u8; 476];
        unsafe { driver.memcpy_dtoh_async(0, out.as_mut_ptr(), g[q].data.offset(136), 476, queue.handle())? };
        backend.synchronize()?;
        Ok(out)
    };
    assert!(padding_of(BufferUsage::Any)?.iter().all(|&b| b == 0));
    // weights get their padding from the host runtime
    assert!(padding_of(BufferUsage::Weights)?.iter().all(|&b| b == UNINITIALIZED_BYTE));
    Ok(())
}

#[test]
fn split_roundtrip() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(2))?;
    let buft = registry.split_buffer_type(&[1.0, 3.0])?;
    let mut g = Graph::new();
    let w = g.tensor(DType::F32, &[8, 128]);
    let buffer = Arc::new(buft.clone().alloc_buffer(buft.alloc_size(&g[w]))?);
    assert_eq!(buffer.kind(), BufferKind::Split);
    TensorAllocator::new(buffer.clone()).alloc(&mut g, w)?;

    let data: Vec<f32> = (0..8 * 128).map(|i| i as f32).collect();
    buffer.set_tensor(&g[w], &bytes(&data), 0)?;
    let mut out = vec![0u8; data.len() * 4];
    buffer.get_tensor(&g[w], &mut out, 0)?;
    assert_eq!(floats(&out), data);

    buffer.memset_tensor(&g[w], 0, 0, data.len() * 4)?;
    buffer.get_tensor(&g[w], &mut out, 0)?;
    assert!(out.iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn split_roundtrip_with_batches() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(2))?;
    let buft = registry.split_buffer_type(&[])?;
    let mut g = Graph::new();
    let w = g.tensor(DType::F32, &[4, 64, 2]);
    let buffer = Arc::new(buft.clone().alloc_buffer(buft.alloc_size(&g[w]))?);
    TensorAllocator::new(buffer.clone()).alloc(&mut g, w)?;
    let rows: i64 = g[w].extra.as_ref().map_or(0, |t| t.slices().map(|(_, s)| s.rows.rows()).sum());
    assert_eq!(rows, 128);

    let data: Vec<f32> = (0..4 * 64 * 2).map(|i| i as f32).collect();
    buffer.set_tensor(&g[w], &bytes(&data), 0)?;
    let mut out = vec![0u8; data.len() * 4];
    buffer.get_tensor(&g[w], &mut out, 0)?;
    assert_eq!(floats(&out), data);
    Ok(())
}

#[test]
fn rejected_split_tensor_stays_unbound() -> Result<(), XpuError> {
    let (driver, registry) = setup(BackendConfig::emulated(2))?;
    let buft = registry.split_buffer_type(&[])?;
    let mut g = Graph::new();
    let w = g.tensor(DType::F32, &[8, 64]);
    let size = buft.alloc_size(&g[w]);
    // rows twice as far apart as their length
    g[w].nb[1] *= 2;
    let buffer = Arc::new(buft.clone().alloc_buffer(size)?);
    let before = [driver.stats(0).live_allocations, driver.stats(1).live_allocations];
    let mut alloc = TensorAllocator::new(buffer);
    let err = alloc.alloc(&mut g, w).unwrap_err();
    assert_eq!(err.status, ErrorStatus::InvalidTensor);
    assert!(g[w].buffer.is_none());
    assert!(g[w].extra.is_none());
    assert_eq!([driver.stats(0).live_allocations, driver.stats(1).live_allocations], before);

    let v = g.tensor(DType::F32, &[8, 64]);
    alloc.alloc(&mut g, v)?;
    assert!(g[v].extra.is_some());
    Ok(())
}

#[test]
fn split_transfers_are_whole() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(2))?;
    let buft = registry.split_buffer_type(&[])?;
    let mut g = Graph::new();
    let w = g.tensor(DType::F32, &[8, 64]);
    let buffer = Arc::new(buft.clone().alloc_buffer(buft.alloc_size(&g[w]))?);
    TensorAllocator::new(buffer.clone()).alloc(&mut g, w)?;

    let err = buffer.set_tensor(&g[w], &[0; 32], 0).unwrap_err();
    assert_eq!(err.status, ErrorStatus::InvalidTensor);
    let mut out = vec![0u8; 8 * 64 * 4];
    let err = buffer.get_tensor(&g[w], &mut out[4..], 4).unwrap_err();
    assert_eq!(err.status, ErrorStatus::InvalidTensor);
    let err = buffer.memset_tensor(&g[w], 0, 0, 16).unwrap_err();
    assert_eq!(err.status, ErrorStatus::InvalidTensor);
    Ok(())
}

#[test]
fn split_rejects_views() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(2))?;
    let buft = registry.split_buffer_type(&[])?;
    let mut g = Graph::new();
    let w = g.tensor(DType::F32, &[8, 64]);
    let t = g.transpose(w);
    let buffer = Arc::new(buft.clone().alloc_buffer(buft.alloc_size(&g[w]))?);
    g[t].buffer = Some(buffer.clone());
    let err = buffer.init_tensor(&mut g[t]).unwrap_err();
    assert_eq!(err.status, ErrorStatus::InvalidTensor);
    Ok(())
}

#[test]
fn split_clear_keeps_padding() -> Result<(), XpuError> {
    let (driver, registry) = setup(BackendConfig::emulated(2))?;
    let buft = registry.split_buffer_type(&[])?;
    let backend = registry.device(1)?.init_backend()?;
    let mut g = Graph::new();
    let w = g.tensor(DType::F32, &[100, 64]);
    let buffer = Arc::new(buft.clone().alloc_buffer(buft.alloc_size(&g[w]))?);
    TensorAllocator::new(buffer.clone()).alloc(&mut g, w)?;
    buffer.clear(0xFF)?;

    let mut out = vec![0u8; 100 * 64 * 4];
    buffer.get_tensor(&g[w], &mut out, 0)?;
    assert!(out.iter().all(|&b| b == 0xFF));

    let slice = *g[w].extra.as_ref().unwrap().slice(1).unwrap();
    let mut tail = vec![1u8; slice.size - slice.data_size];
    assert!(!tail.is_empty());
    let queue = backend.context().queue(1)?;
    unsafe {
        driver.memcpy_dtoh_async(1, tail.as_mut_ptr(), slice.ptr.offset(slice.data_size), tail.len(), queue.handle())?
    };
    backend.synchronize()?;
    assert!(tail.iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn host_buffer_falls_back_to_plain_memory() -> Result<(), XpuError> {
    let mut config = BackendConfig::emulated(1);
    config.emulated.pinned_host = false;
    let (_, registry) = setup(config)?;
    let buft = registry.device(0)?.host_buffer_type();
    assert!(buft.is_host());
    let buffer = Arc::new(buft.alloc_buffer(512)?);
    assert_eq!(buffer.kind(), BufferKind::Host { pinned: false });
    assert!(buffer.is_host());

    let mut g = Graph::new();
    let a = g.tensor(DType::F32, &[4]);
    TensorAllocator::new(buffer.clone()).alloc(&mut g, a)?;
    buffer.set_tensor(&g[a], &bytes(&[1.0, 2.0, 3.0, 4.0]), 0)?;
    let mut out = vec![0u8; 16];
    buffer.get_tensor(&g[a], &mut out, 0)?;
    assert_eq!(floats(&out), &[1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn pinned_host_buffer() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let buffer = Arc::new(registry.device(0)?.host_buffer_type().alloc_buffer(512)?);
    assert_eq!(buffer.kind(), BufferKind::Host { pinned: true });
    let mut g = Graph::new();
    let a = g.tensor(DType::I8, &[64]);
    TensorAllocator::new(buffer.clone()).alloc(&mut g, a)?;
    buffer.clear(3)?;
    let mut out = vec![0u8; 64];
    buffer.get_tensor(&g[a], &mut out, 0)?;
    assert_eq!(out, vec![3u8; 64]);
    Ok(())
}
