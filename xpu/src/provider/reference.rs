//! Host side kernels.
//!
//! Operands are copied to host memory, evaluated in f32 and copied back. Every call blocks
//! until its copies completed, so results are visible to the next node without extra ordering.

use std::sync::atomic::{AtomicU64, Ordering};

use half::{bf16, f16};

use super::{ComputeHandle, ComputeProvider, RowSliceMatMul};
use crate::{
    buffer::{check_range, BufferKind},
    context::DeviceContext,
    driver::{DevicePtr, QueueHandle},
    error::{BackendError, ErrorStatus},
    graph::Graph,
    supports::can_mul_mat,
    tensor::{Op, Tensor, TensorId, UnaryOp},
    DType, DeviceId, MAX_DIMS,
};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Compute provider evaluating kernels on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceProvider;

impl ComputeProvider for ReferenceProvider {
    fn name(&self) -> &str {
        "reference"
    }

    fn create_handle(&self, _device: DeviceId, _queue: &crate::context::Queue) -> Result<ComputeHandle, BackendError> {
        Ok(ComputeHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)))
    }

    fn destroy_handle(&self, _device: DeviceId, _handle: ComputeHandle) -> Result<(), BackendError> {
        Ok(())
    }

    fn compute(&self, ctx: &DeviceContext, graph: &Graph, node: TensorId) -> Result<bool, BackendError> {
        let dst = &graph[node];
        let srcs: Vec<&Tensor> = dst.sources().map(|id| &graph[id]).collect();
        if dst.extra.is_some() || srcs.iter().any(|s| s.extra.is_some()) {
            return Ok(false);
        }
        let mut inputs = Vec::with_capacity(srcs.len());
        for src in &srcs {
            let Some(span) = read_span(ctx, src)? else { return Ok(false) };
            let Some(values) = load(src, &span) else { return Ok(false) };
            inputs.push(values);
        }
        let Some(values) = evaluate(dst, &srcs, &inputs)? else { return Ok(false) };
        let Some(mut span) = read_span(ctx, dst)? else { return Ok(false) };
        if !store(dst, &mut span, &values) {
            return Ok(false);
        }
        write_span(ctx, dst, &span)?;
        Ok(true)
    }

    fn mul_mat_rows(&self, ctx: &DeviceContext, job: &RowSliceMatMul) -> Result<bool, BackendError> {
        if !matches!(job.src0_type, DType::F32 | DType::F16 | DType::BF16) {
            return Ok(false);
        }
        let (k, rows, cols) = (job.ne00 as usize, job.rows as usize, job.ne11 as usize);
        let queue = job.queue.handle();
        let a = download(ctx, job.device, queue, job.src0, rows * job.src0_type.row_size(job.ne00))?;
        let b = download(ctx, job.device, queue, job.src1, cols * k * 4)?;
        let ts = job.src0_type.type_size();
        let a: Vec<f32> = a.chunks_exact(ts).map(|e| element(job.src0_type, e)).collect();
        let b: Vec<f32> = b.chunks_exact(4).map(|e| element(DType::F32, e)).collect();
        let mut out = Vec::with_capacity(rows * cols * 4);
        for c in 0..cols {
            for r in 0..rows {
                let v: f32 = (0..k).map(|i| a[r * k + i] * b[c * k + i]).sum();
                out.extend_from_slice(&v.to_ne_bytes());
            }
        }
        upload(ctx, job.device, queue, job.dst, &out)?;
        Ok(true)
    }
}

fn download(
    ctx: &DeviceContext,
    device: DeviceId,
    queue: QueueHandle,
    src: DevicePtr,
    bytes: usize,
) -> Result<Vec<u8>, BackendError> {
    let mut data = vec![0u8; bytes];
    let driver = ctx.driver();
    // SAFETY: `data` outlives the copy, the queue is synchronized before returning
    unsafe { driver.memcpy_dtoh_async(device, data.as_mut_ptr(), src, bytes, queue) }.map_err(|e| e.on_device(device))?;
    driver.queue_synchronize(device, queue).map_err(|e| e.on_device(device))?;
    Ok(data)
}

fn upload(
    ctx: &DeviceContext,
    device: DeviceId,
    queue: QueueHandle,
    dst: DevicePtr,
    data: &[u8],
) -> Result<(), BackendError> {
    let driver = ctx.driver();
    // SAFETY: `data` outlives the copy, the queue is synchronized before returning
    unsafe { driver.memcpy_htod_async(device, dst, data.as_ptr(), data.len(), queue) }.map_err(|e| e.on_device(device))?;
    driver.queue_synchronize(device, queue).map_err(|e| e.on_device(device))
}

/// Bytes covered by `t`, `None` if they are not reachable from the host.
fn read_span(ctx: &DeviceContext, t: &Tensor) -> Result<Option<Vec<u8>>, BackendError> {
    let Some(buffer) = &t.buffer else { return Ok(None) };
    let bytes = t.nbytes();
    match buffer.kind() {
        BufferKind::Device(device) => {
            let queue = ctx.queue(device)?;
            download(ctx, device, queue.handle(), t.data, bytes).map(Some)
        }
        BufferKind::Host { .. } => {
            check_range(buffer.base(), buffer.size(), t, 0, bytes)?;
            let mut data = vec![0u8; bytes];
            // SAFETY: range checked against the host buffer above
            unsafe { std::ptr::copy_nonoverlapping(t.data.0 as *const u8, data.as_mut_ptr(), bytes) };
            Ok(Some(data))
        }
        BufferKind::Split => Ok(None),
    }
}

fn write_span(ctx: &DeviceContext, t: &Tensor, data: &[u8]) -> Result<(), BackendError> {
    let Some(buffer) = &t.buffer else {
        return Err(BackendError::new(ErrorStatus::InvalidTensor, format!("tensor '{}' is not allocated", t.name)));
    };
    match buffer.kind() {
        BufferKind::Device(device) => {
            let queue = ctx.queue(device)?;
            upload(ctx, device, queue.handle(), t.data, data)
        }
        BufferKind::Host { .. } => {
            check_range(buffer.base(), buffer.size(), t, 0, data.len())?;
            // SAFETY: range checked against the host buffer above
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), t.data.0 as *mut u8, data.len()) };
            Ok(())
        }
        BufferKind::Split => Err(BackendError::new(
            ErrorStatus::InvalidBuffer,
            format!("tensor '{}' in a split buffer can not be written by the reference provider", t.name),
        )),
    }
}

fn word<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut w = [0; N];
    w.copy_from_slice(&bytes[..N]);
    w
}

fn element(dtype: DType, bytes: &[u8]) -> f32 {
    match dtype {
        DType::F16 => f16::from_ne_bytes(word(bytes)).to_f32(),
        DType::BF16 => bf16::from_ne_bytes(word(bytes)).to_f32(),
        DType::I32 => i32::from_ne_bytes(word(bytes)) as f32,
        _ => f32::from_ne_bytes(word(bytes)),
    }
}

fn put_element(dtype: DType, bytes: &mut [u8], v: f32) {
    match dtype {
        DType::F16 => bytes[..2].copy_from_slice(&f16::from_f32(v).to_ne_bytes()),
        DType::BF16 => bytes[..2].copy_from_slice(&bf16::from_f32(v).to_ne_bytes()),
        DType::I32 => bytes[..4].copy_from_slice(&(v.round() as i32).to_ne_bytes()),
        _ => bytes[..4].copy_from_slice(&v.to_ne_bytes()),
    }
}

fn is_host_evaluable(dtype: DType) -> bool {
    matches!(dtype, DType::F32 | DType::F16 | DType::BF16 | DType::I32)
}

/// Calls `f` for every element index, innermost dimension fastest.
fn for_each_index(ne: [i64; MAX_DIMS], mut f: impl FnMut([i64; MAX_DIMS])) {
    for i3 in 0..ne[3] {
        for i2 in 0..ne[2] {
            for i1 in 0..ne[1] {
                for i0 in 0..ne[0] {
                    f([i0, i1, i2, i3]);
                }
            }
        }
    }
}

fn byte_offset(t: &Tensor, idx: [i64; MAX_DIMS]) -> usize {
    idx.iter().zip(t.nb).map(|(&i, nb)| i as usize * nb).sum()
}

/// Elements of `t` in logical order.
fn load(t: &Tensor, span: &[u8]) -> Option<Vec<f32>> {
    if !is_host_evaluable(t.dtype) {
        return None;
    }
    let mut values = Vec::with_capacity(t.nelements() as usize);
    for_each_index(t.ne, |idx| values.push(element(t.dtype, &span[byte_offset(t, idx)..])));
    Some(values)
}

fn store(t: &Tensor, span: &mut [u8], values: &[f32]) -> bool {
    if !is_host_evaluable(t.dtype) || values.len() != t.nelements() as usize {
        return false;
    }
    let mut i = 0;
    for_each_index(t.ne, |idx| {
        put_element(t.dtype, &mut span[byte_offset(t, idx)..], values[i]);
        i += 1;
    });
    true
}

/// Dense index of `idx` in a tensor of extents `ne`, repeating along broadcast dimensions.
fn broadcast_index(idx: [i64; MAX_DIMS], ne: [i64; MAX_DIMS]) -> usize {
    let mut i = 0;
    for d in (0..MAX_DIMS).rev() {
        i = i * ne[d] + idx[d] % ne[d];
    }
    i as usize
}

fn binary(dst: &Tensor, b: &Tensor, a: &[f32], bv: &[f32], f: impl Fn(f32, f32) -> f32) -> Vec<f32> {
    let mut out = Vec::with_capacity(a.len());
    let mut i = 0;
    for_each_index(dst.ne, |idx| {
        out.push(f(a[i], bv[broadcast_index(idx, b.ne)]));
        i += 1;
    });
    out
}

fn unary(op: UnaryOp, x: f32) -> Option<f32> {
    Some(match op {
        UnaryOp::Abs => x.abs(),
        UnaryOp::Neg => -x,
        UnaryOp::Relu => x.max(0.0),
        UnaryOp::Tanh => x.tanh(),
        UnaryOp::Exp => x.exp(),
        UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        UnaryOp::Silu => x / (1.0 + (-x).exp()),
        UnaryOp::Gelu => {
            const SQRT_2_OVER_PI: f32 = 0.797_884_6;
            0.5 * x * (1.0 + (SQRT_2_OVER_PI * x * (1.0 + 0.044_715 * x * x)).tanh())
        }
        _ => return None,
    })
}

fn evaluate(dst: &Tensor, srcs: &[&Tensor], inputs: &[Vec<f32>]) -> Result<Option<Vec<f32>>, BackendError> {
    let row = dst.ne[0].max(1) as usize;
    Ok(Some(match dst.op {
        Op::Dup | Op::Cont | Op::Cpy => {
            if inputs[0].len() != dst.nelements() as usize {
                return Ok(None);
            }
            inputs[0].clone()
        }
        Op::Add => binary(dst, srcs[1], &inputs[0], &inputs[1], |x, y| x + y),
        Op::Sub => binary(dst, srcs[1], &inputs[0], &inputs[1], |x, y| x - y),
        Op::Mul => binary(dst, srcs[1], &inputs[0], &inputs[1], |x, y| x * y),
        Op::Div => binary(dst, srcs[1], &inputs[0], &inputs[1], |x, y| x / y),
        Op::Scale => {
            let s = dst.op_param_f32(0);
            inputs[0].iter().map(|x| x * s).collect()
        }
        Op::Sqr => inputs[0].iter().map(|x| x * x).collect(),
        Op::Sqrt => inputs[0].iter().map(|x| x.sqrt()).collect(),
        Op::Unary(op) => {
            let mut out = Vec::with_capacity(inputs[0].len());
            for &x in &inputs[0] {
                let Some(y) = unary(op, x) else { return Ok(None) };
                out.push(y);
            }
            out
        }
        Op::SoftMax => {
            let scale = dst.op_param_f32(0);
            let mut out = Vec::with_capacity(inputs[0].len());
            for (r, chunk) in inputs[0].chunks(row).enumerate() {
                let mut x: Vec<f32> = chunk.iter().map(|v| v * scale).collect();
                if let (Some(mask), Some(m)) = (srcs.get(1), inputs.get(1)) {
                    let mrow = r % (mask.ne[1] as usize);
                    x.iter_mut().zip(&m[mrow * row..]).for_each(|(v, m)| *v += m);
                }
                let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let sum: f32 = x.iter_mut().map(|v| { *v = (*v - max).exp(); *v }).sum();
                out.extend(x.iter().map(|v| v / sum));
            }
            out
        }
        Op::RmsNorm => {
            let eps = dst.op_param_f32(0);
            let mut out = Vec::with_capacity(inputs[0].len());
            for chunk in inputs[0].chunks(row) {
                let mean = chunk.iter().map(|v| v * v).sum::<f32>() / chunk.len() as f32;
                let scale = 1.0 / (mean + eps).sqrt();
                out.extend(chunk.iter().map(|v| v * scale));
            }
            out
        }
        Op::GetRows => {
            let (a, rows) = (srcs[0], srcs[1]);
            let mut out = Vec::with_capacity(dst.nelements() as usize);
            let mut r = 0;
            for_each_index([1, rows.ne[0], rows.ne[1], rows.ne[2]], |[_, _, i11, i12]| {
                let index = inputs[1][r] as i64;
                r += 1;
                if (0..a.ne[1]).contains(&index) {
                    let base = broadcast_index([0, index, i11, i12], a.ne);
                    out.extend_from_slice(&inputs[0][base..base + a.ne[0] as usize]);
                }
            });
            if out.len() != dst.nelements() as usize {
                return Err(BackendError::new(
                    ErrorStatus::InvalidTensor,
                    format!("get_rows '{}' references a row outside 0..{}", dst.name, a.ne[1]),
                ));
            }
            out
        }
        Op::MulMat => {
            let (a, b) = (srcs[0], srcs[1]);
            if !can_mul_mat(a, b) {
                return Ok(None);
            }
            let k = a.ne[0] as usize;
            let (r2, r3) = (b.ne[2] / a.ne[2], b.ne[3] / a.ne[3]);
            let mut out = Vec::with_capacity(dst.nelements() as usize);
            for_each_index(dst.ne, |[m, n, i2, i3]| {
                let ab = broadcast_index([0, m, i2 / r2, i3 / r3], a.ne);
                let bb = broadcast_index([0, n, i2, i3], b.ne);
                out.push((0..k).map(|i| inputs[0][ab + i] * inputs[1][bb + i]).sum());
            });
            out
        }
        _ => return Ok(None),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_repeats_smaller_operand() {
        let ne = [2, 1, 1, 1];
        assert_eq!(broadcast_index([1, 5, 0, 0], ne), 1);
        assert_eq!(broadcast_index([3, 0, 0, 0], [4, 2, 1, 1]), 3);
        assert_eq!(broadcast_index([3, 1, 0, 0], [4, 2, 1, 1]), 7);
    }

    #[test]
    fn strided_load_follows_nb() {
        // 2x2 f32 transposed view of [1, 2, 3, 4]
        let mut t = Tensor::new(DType::F32, &[2, 2]);
        t.nb = [8, 4, 16, 16];
        let span: Vec<u8> = [1f32, 2., 3., 4.].iter().flat_map(|v| v.to_ne_bytes()).collect();
        assert_eq!(load(&t, &span), Some(vec![1., 3., 2., 4.]));
    }

    #[test]
    fn half_conversion() {
        let t = Tensor::new(DType::F16, &[3]);
        let mut span = vec![0u8; 6];
        assert!(store(&t, &mut span, &[0.5, -2.0, 1.0]));
        assert_eq!(load(&t, &span), Some(vec![0.5, -2.0, 1.0]));
        assert!(load(&Tensor::new(DType::Q4_0, &[32]), &[0u8; 18]).is_none());
    }

    #[test]
    fn activations() {
        assert_eq!(unary(UnaryOp::Relu, -1.0), Some(0.0));
        assert_eq!(unary(UnaryOp::Neg, 2.0), Some(-2.0));
        assert!((unary(UnaryOp::Sigmoid, 0.0).unwrap_or_default() - 0.5).abs() < 1e-6);
        assert!(unary(UnaryOp::HardSwish, 1.0).is_none());
    }
}
