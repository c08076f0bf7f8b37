use std::sync::Arc;

use xpu::{
    driver::EmulatedDriver, BackendConfig, BufferType, DType, ErrorStatus, Graph, Op, ReferenceProvider, Registry,
    TensorAllocator, TensorId, UnaryOp, XpuError,
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

fn set(g: &Graph, t: TensorId, data: &[f32]) -> Result<(), XpuError> {
    if let Some(buffer) = &g[t].buffer {
        buffer.set_tensor(&g[t], &bytes(data), 0)?;
    }
    Ok(())
}

fn get(g: &Graph, t: TensorId) -> Result<Vec<f32>, XpuError> {
    let mut out = vec![0u8; g[t].nbytes()];
    if let Some(buffer) = &g[t].buffer {
        buffer.get_tensor(&g[t], &mut out, 0)?;
    }
    Ok(floats(&out))
}

/// Binds every not yet bound tensor of `g` to one buffer on `device`.
fn alloc_all(registry: &Registry, g: &mut Graph, device: usize) -> Result<(), XpuError> {
    let buffer = Arc::new(registry.device(device)?.buffer_type().alloc_buffer(1 << 16)?);
    let mut alloc = TensorAllocator::new(buffer);
    let ids: Vec<TensorId> = g.ids().collect();
    for id in ids {
        if g[id].buffer.is_none() {
            alloc.alloc(g, id)?;
        }
    }
    Ok(())
}

fn assert_close(x: &[f32], y: &[f32]) {
    assert_eq!(x.len(), y.len());
    for (x, y) in x.iter().zip(y) {
        assert!((x - y).abs() < 1e-5, "{x} != {y}");
    }
}

#[test]
fn elementwise_chain() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let backend = registry.device(0)?.init_backend()?;
    let mut g = Graph::new();
    let a = g.tensor(DType::F32, &[4, 2]);
    let b = g.tensor(DType::F32, &[4]);
    let sum = g.add(a, b);
    let scaled = g.scale(sum, 0.5);
    let out = g.unary(scaled, UnaryOp::Relu);
    g.build_forward(out);
    alloc_all(&registry, &mut g, 0)?;

    set(&g, a, &[1.0, -2.0, 3.0, -4.0, 5.0, -6.0, 7.0, -8.0])?;
    set(&g, b, &[1.0, 1.0, 1.0, 1.0])?;
    backend.graph_compute(&g);
    backend.synchronize()?;
    assert_eq!(get(&g, sum)?, [2.0, -1.0, 4.0, -3.0, 6.0, -5.0, 8.0, -7.0]);
    assert_eq!(get(&g, out)?, [1.0, 0.0, 2.0, 0.0, 3.0, 0.0, 4.0, 0.0]);
    Ok(())
}

#[test]
fn matmul_softmax_norm() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let backend = registry.device(0)?.init_backend()?;
    let mut g = Graph::new();
    let w = g.tensor(DType::F32, &[3, 2]);
    let x = g.tensor(DType::F32, &[3, 2]);
    let mm = g.mul_mat(w, x);
    let sm = g.soft_max(mm, 1.0);
    let norm = g.rms_norm(mm, 0.0);
    g.build_forward(sm);
    g.build_forward(norm);
    alloc_all(&registry, &mut g, 0)?;

    set(&g, w, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0])?;
    set(&g, x, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
    backend.try_graph_compute(&g)?;
    backend.synchronize()?;

    // rows of w pick components 0 and 1 of each column of x
    assert_eq!(get(&g, mm)?, [1.0, 2.0, 4.0, 5.0]);
    let e = 1f32.exp();
    assert_close(&get(&g, sm)?, &[1.0 / (1.0 + e), e / (1.0 + e), 1.0 / (1.0 + e), e / (1.0 + e)]);
    let (r0, r1) = ((2.5f32).sqrt(), (20.5f32).sqrt());
    assert_close(&get(&g, norm)?, &[1.0 / r0, 2.0 / r0, 4.0 / r1, 5.0 / r1]);
    Ok(())
}

#[test]
fn layout_nodes_issue_nothing() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let backend = registry.device(0)?.init_backend()?;
    let mut g = Graph::new();
    let a = g.tensor(DType::F32, &[2, 2]);
    let flat = g.reshape(a, &[4]);
    let neg = g.unary(flat, UnaryOp::Neg);
    g.build_forward(neg);
    assert_eq!(g.nodes(), &[flat, neg]);
    alloc_all(&registry, &mut g, 0)?;
    set(&g, a, &[1.0, 2.0, 3.0, 4.0])?;
    backend.try_graph_compute(&g)?;
    assert_eq!(get(&g, neg)?, [-1.0, -2.0, -3.0, -4.0]);
    Ok(())
}

#[test]
fn empty_tensors_are_skipped() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let backend = registry.device(0)?.init_backend()?;
    let mut g = Graph::new();
    let a = g.tensor(DType::F32, &[0, 4]);
    let out = g.unary(a, UnaryOp::Exp);
    g.build_forward(out);
    // never bound, would fail if it was dispatched
    backend.try_graph_compute(&g)?;
    Ok(())
}

#[test]
fn get_rows_out_of_range() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let backend = registry.device(0)?.init_backend()?;
    let mut g = Graph::new();
    let a = g.tensor(DType::F32, &[2, 3]);
    let idx = g.tensor(DType::I32, &[2]);
    let rows = g.get_rows(a, idx);
    g.build_forward(rows);
    alloc_all(&registry, &mut g, 0)?;
    set(&g, a, &[0.0, 1.0, 10.0, 11.0, 20.0, 21.0])?;

    let indices: Vec<u8> = [2i32, 0].iter().flat_map(|i| i.to_ne_bytes()).collect();
    if let Some(buffer) = &g[idx].buffer {
        buffer.set_tensor(&g[idx], &indices, 0)?;
    }
    backend.try_graph_compute(&g)?;
    assert_eq!(get(&g, rows)?, [20.0, 21.0, 0.0, 1.0]);

    let indices: Vec<u8> = [3i32, 0].iter().flat_map(|i| i.to_ne_bytes()).collect();
    if let Some(buffer) = &g[idx].buffer {
        buffer.set_tensor(&g[idx], &indices, 0)?;
    }
    let err = backend.try_graph_compute(&g).unwrap_err();
    assert_eq!(err.status, ErrorStatus::InvalidTensor);
    Ok(())
}

#[test]
fn missing_kernel_is_an_error() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let backend = registry.device(0)?.init_backend()?;
    let mut g = Graph::new();
    let a = g.tensor(DType::F32, &[4]);
    let set_node = g.op(Op::Set, DType::F32, &[4], &[a]);
    g.build_forward(set_node);
    alloc_all(&registry, &mut g, 0)?;
    let err = backend.try_graph_compute(&g).unwrap_err();
    assert_eq!(err.status, ErrorStatus::UnsupportedOperation);
    assert_eq!(err.device, Some(0));
    Ok(())
}

#[test]
fn mismatched_batches_are_not_computed() -> Result<(), XpuError> {
    let (_, registry) = setup(BackendConfig::emulated(1))?;
    let device = registry.device(0)?;
    let backend = device.init_backend()?;
    let mut g = Graph::new();
    let a = g.tensor(DType::F32, &[8, 4, 2]);
    let b = g.tensor(DType::F32, &[8, 2, 1]);
    let mm = g.mul_mat(a, b);
    g.build_forward(mm);
    alloc_all(&registry, &mut g, 0)?;
    assert!(!device.supports_op(&g, mm));
    let err = backend.try_graph_compute(&g).unwrap_err();
    assert_eq!(err.status, ErrorStatus::UnsupportedOperation);
    Ok(())
}

/// Row `r`, column `k` of the weights
fn weight(r: usize, k: usize) -> f32 {
    ((r * 7 + k * 3) % 5) as f32 - 2.0
}

fn input(c: usize, k: usize) -> f32 {
    ((c + k) % 3) as f32 - 1.0
}

/// Multiplies split weights of 100 rows on two devices with a batch living on `main`.
fn split_mul_mat(config: BackendConfig, main: usize) -> Result<Arc<EmulatedDriver>, XpuError> {
    const K: usize = 64;
    const ROWS: usize = 100;
    const COLS: usize = 3;
    let (driver, registry) = setup(config)?;
    let backend = registry.device(main)?.init_backend()?;
    let buft = registry.split_buffer_type(&[])?;

    let mut g = Graph::new();
    let w = g.tensor(DType::F32, &[K as i64, ROWS as i64]);
    let split_buffer = Arc::new(buft.clone().alloc_buffer(buft.alloc_size(&g[w]))?);
    TensorAllocator::new(split_buffer.clone()).alloc(&mut g, w)?;
    let x = g.tensor(DType::F32, &[K as i64, COLS as i64]);
    let y = g.mul_mat(w, x);
    g.build_forward(y);
    alloc_all(&registry, &mut g, main)?;
    assert!(registry.device(main)?.supports_op(&g, y));

    let wv: Vec<f32> = (0..ROWS).flat_map(|r| (0..K).map(move |k| weight(r, k))).collect();
    split_buffer.set_tensor(&g[w], &bytes(&wv), 0)?;
    let xv: Vec<f32> = (0..COLS).flat_map(|c| (0..K).map(move |k| input(c, k))).collect();
    set(&g, x, &xv)?;

    backend.graph_compute(&g);
    backend.synchronize()?;

    let expected: Vec<f32> = (0..COLS)
        .flat_map(|c| (0..ROWS).map(move |r| (0..K).map(|k| weight(r, k) * input(c, k)).sum::<f32>()))
        .collect();
    assert_eq!(get(&g, y)?, expected);
    Ok(driver)
}

#[cfg(feature = "peer_copy")]
#[test]
fn split_mul_mat_with_peer_copies() -> Result<(), XpuError> {
    let driver = split_mul_mat(BackendConfig::emulated(2), 0)?;
    assert!(driver.stats(0).peer_copies > 0);
    assert!(driver.stats(1).peer_copies > 0);
    Ok(())
}

#[test]
fn split_mul_mat_through_host() -> Result<(), XpuError> {
    let mut config = BackendConfig::emulated(2);
    config.peer_copy = false;
    let driver = split_mul_mat(config, 0)?;
    assert_eq!(driver.stats(0).peer_copies, 0);
    assert_eq!(driver.stats(1).peer_copies, 0);
    Ok(())
}

#[test]
fn split_mul_mat_on_second_device() -> Result<(), XpuError> {
    let mut config = BackendConfig::emulated(2);
    config.peer_copy = false;
    split_mul_mat(config, 1)?;
    Ok(())
}

#[test]
fn split_mul_mat_releases_temporaries() -> Result<(), XpuError> {
    let mut config = BackendConfig::emulated(2);
    config.peer_copy = false;
    let driver = split_mul_mat(config, 0)?;
    // only buffers are left once the graph and backend are gone
    assert_eq!(driver.stats(0).live_allocations, 0);
    assert_eq!(driver.stats(1).live_allocations, 0);
    Ok(())
}
