//! Walks the node list of a graph and issues each node on the main device.

use crate::{
    buffer::BufferKind,
    context::{DeviceContext, Queue},
    copy::{CopyMode, CopyNegotiator},
    driver::DevicePtr,
    error::{BackendError, ErrorStatus},
    graph::Graph,
    provider::RowSliceMatMul,
    tensor::{Op, Tensor, TensorId},
    DType, DeviceId,
};

/// Whether every operand of `t` lives on `device`, split `src0` of a matrix multiplication excepted.
fn operands_on_device(graph: &Graph, t: &Tensor, device: DeviceId) -> bool {
    let placed = |x: &Tensor, split_allowed: bool| match x.buffer_kind() {
        Some(BufferKind::Device(d)) => d == device,
        Some(BufferKind::Split) => split_allowed,
        _ => true,
    };
    placed(t, false)
        && t.src.iter().enumerate().all(|(i, s)| s.map_or(true, |id| placed(&graph[id], t.op == Op::MulMat && i == 0)))
}

fn has_split_src0(graph: &Graph, t: &Tensor) -> bool {
    t.src[0].is_some_and(|id| graph[id].buffer_kind() == Some(BufferKind::Split))
}

/// Issues every node of `graph` on the context's main device.
///
/// Layout nodes and empty tensors issue nothing. The work is only queued, callers synchronize
/// before reading results.
pub fn graph_compute(ctx: &DeviceContext, graph: &Graph) -> Result<(), BackendError> {
    let device = ctx.device();
    let debug = ctx.config().debug_dispatch();
    ctx.handle(device)?;
    for &node in graph.nodes() {
        let t = &graph[node];
        if t.is_empty() || t.op.is_layout() {
            verbose!(debug, "xpu::dispatch", device, node = node.index(), op = ?t.op, "skip '{}'", t.name);
            continue;
        }
        debug_assert!(
            operands_on_device(graph, t, device),
            "operands of '{}' are not placed on device {device}",
            t.name
        );
        verbose!(debug, "xpu::dispatch", device, node = node.index(), op = ?t.op, dtype = %t.dtype, "dispatch '{}'", t.name);
        let handled = if t.op == Op::MulMat && has_split_src0(graph, t) {
            split_mul_mat(ctx, graph, node)?
        } else {
            ctx.provider().compute(ctx, graph, node)?
        };
        if !handled {
            return Err(BackendError::new(
                ErrorStatus::UnsupportedOperation,
                format!("{:?} of '{}' has no kernel in {}", t.op, t.name, ctx.provider().name()),
            )
            .on_device(device));
        }
    }
    Ok(())
}

fn download(ctx: &DeviceContext, device: DeviceId, src: DevicePtr, bytes: usize) -> Result<Vec<u8>, BackendError> {
    let queue = ctx.queue(device)?;
    let mut data = vec![0u8; bytes];
    // SAFETY: `data` outlives the copy, the queue is synchronized before returning
    unsafe { ctx.driver().memcpy_dtoh_async(device, data.as_mut_ptr(), src, bytes, queue.handle()) }
        .map_err(|e| e.on_device(device))?;
    ctx.synchronize(device)?;
    Ok(data)
}

fn upload(ctx: &DeviceContext, device: DeviceId, dst: DevicePtr, data: &[u8]) -> Result<(), BackendError> {
    let queue = ctx.queue(device)?;
    // SAFETY: `data` outlives the copy, the queue is synchronized before returning
    unsafe { ctx.driver().memcpy_htod_async(device, dst, data.as_ptr(), data.len(), queue.handle()) }
        .map_err(|e| e.on_device(device))?;
    ctx.synchronize(device)
}

/// Makes work issued on `waiter` after this call start once `signaler` reached its current end.
fn order_after(ctx: &DeviceContext, signaler: &Queue, waiter: &Queue) -> Result<(), BackendError> {
    if signaler == waiter {
        return Ok(());
    }
    let event = ctx.new_event(signaler.device())?;
    event.record(signaler)?;
    event.wait(waiter)
}

fn copy_or_fail(
    negotiator: &CopyNegotiator,
    (src_device, src): (DeviceId, DevicePtr),
    (dst_device, dst): (DeviceId, DevicePtr),
    bytes: usize,
) -> Result<(), BackendError> {
    if negotiator.copy_device(src_device, src, dst_device, dst, bytes, CopyMode::Async)? {
        Ok(())
    } else {
        Err(BackendError::new(
            ErrorStatus::MemoryCopy,
            format!("copy of {bytes} B from device {src_device} to device {dst_device} refused"),
        ))
    }
}

/// Matrix multiplication with row split `src0`. Every device owning rows multiplies its rows
/// with a copy of `src1`, the results are gathered into `dst` on the main device.
fn split_mul_mat(ctx: &DeviceContext, graph: &Graph, node: TensorId) -> Result<bool, BackendError> {
    let dst = &graph[node];
    let (Some(a), Some(b)) = (dst.src[0].map(|id| &graph[id]), dst.src[1].map(|id| &graph[id])) else {
        return Ok(false);
    };
    let Some(table) = a.extra.as_deref() else {
        return Err(BackendError::new(
            ErrorStatus::InvalidTensor,
            format!("split tensor '{}' was not initialized", a.name),
        ));
    };
    let main = ctx.device();
    let dense_f32 = |t: &Tensor| t.dtype == DType::F32 && t.is_contiguous() && t.ne[2] == 1 && t.ne[3] == 1;
    if !dense_f32(b) || !dense_f32(dst) {
        return Ok(false);
    }
    if b.buffer_kind() != Some(BufferKind::Device(main)) || dst.buffer_kind() != Some(BufferKind::Device(main)) {
        return Ok(false);
    }
    let debug = ctx.config().debug_dispatch();
    let negotiator = CopyNegotiator::new(ctx);
    let main_queue = ctx.queue(main)?;
    let (ne00, ne11) = (a.ne[0], b.ne[1]);
    let src1_bytes = b.nbytes();
    // src1 staged through host memory, downloaded once for all devices that need it
    let mut staged_src1: Option<Vec<u8>> = None;

    for (device, slice) in table.slices() {
        let queue = ctx.queue(device)?;
        let pool = ctx.pool(device)?;
        let direct = device == main || negotiator.peer_copy();
        let rows = slice.rows.rows();
        verbose!(
            debug,
            "xpu::dispatch",
            device,
            low = slice.rows.low,
            high = slice.rows.high,
            direct,
            "split mul_mat '{}'",
            dst.name
        );
        // Work queued on main so far produced src1
        order_after(ctx, &main_queue, &queue)?;

        let src1_copy = if device == main {
            None
        } else {
            let tmp = pool.alloc(src1_bytes, &queue)?;
            if direct {
                order_after(ctx, &queue, &main_queue)?;
                copy_or_fail(&negotiator, (main, b.data), (device, tmp.ptr()), src1_bytes)?;
                order_after(ctx, &main_queue, &queue)?;
            } else {
                if staged_src1.is_none() {
                    staged_src1 = Some(download(ctx, main, b.data, src1_bytes)?);
                }
                if let Some(host) = &staged_src1 {
                    upload(ctx, device, tmp.ptr(), host)?;
                }
            }
            Some(tmp)
        };

        let out = pool.alloc(rows as usize * ne11 as usize * 4, &queue)?;
        let job = RowSliceMatMul {
            device,
            queue,
            src0: slice.ptr,
            src0_type: a.dtype,
            ne00,
            rows,
            src1: src1_copy.as_ref().map_or(b.data, |tmp| tmp.ptr()),
            ne11,
            dst: out.ptr(),
        };
        if !ctx.provider().mul_mat_rows(ctx, &job)? {
            return Ok(false);
        }

        // Column c of the slice goes to rows [low, high) of column c of dst
        let column = rows as usize * 4;
        let dst_column = |c: usize| dst.data.offset(c * dst.nb[1] + slice.rows.low as usize * 4);
        if direct {
            order_after(ctx, &main_queue, &queue)?;
            for c in 0..ne11 as usize {
                copy_or_fail(&negotiator, (device, out.ptr().offset(c * column)), (main, dst_column(c)), column)?;
            }
            order_after(ctx, &queue, &main_queue)?;
        } else {
            let host = download(ctx, device, out.ptr(), column * ne11 as usize)?;
            for (c, chunk) in host.chunks_exact(column).enumerate() {
                upload(ctx, main, dst_column(c), chunk)?;
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affinity() {
        let mut g = Graph::new();
        let a = g.tensor(DType::F32, &[4]);
        let b = g.tensor(DType::F32, &[4]);
        let c = g.add(a, b);
        // unbound operands do not pin a device
        assert!(operands_on_device(&g, &g[c], 3));
        assert!(!has_split_src0(&g, &g[c]));
    }
}
