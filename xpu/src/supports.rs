//! Which operations a device can run.
//!
//! Pure functions over tensor descriptors. They never touch device memory, the host runtime
//! calls them for every node and candidate device while planning.

use crate::{
    buffer::BufferKind,
    graph::Graph,
    tensor::{Op, Tensor, TensorId},
    DType, DeviceId,
};

/// Source and destination types accepted by `cpy` beyond same type contiguous copies.
pub const CPY_PAIRS: &[(DType, DType)] = &[
    (DType::F32, DType::F32),
    (DType::F32, DType::F16),
    (DType::F32, DType::BF16),
    (DType::F32, DType::Q8_0),
    (DType::F32, DType::Q4_0),
    (DType::F32, DType::Q4_1),
    (DType::F32, DType::Q5_0),
    (DType::F32, DType::Q5_1),
    (DType::F32, DType::IQ4NL),
    (DType::F16, DType::F16),
    (DType::F16, DType::F32),
    (DType::BF16, DType::F32),
    (DType::Q8_0, DType::F32),
    (DType::Q4_0, DType::F32),
    (DType::Q4_1, DType::F32),
    (DType::Q5_0, DType::F32),
    (DType::Q5_1, DType::F32),
];

/// Types `get_rows` can gather from.
pub const GET_ROWS_TYPES: &[DType] =
    &[DType::F16, DType::F32, DType::Q4_0, DType::Q4_1, DType::Q5_0, DType::Q5_1, DType::Q8_0];

/// Head sizes with flash attention kernels.
pub const FLASH_ATTN_HEAD_SIZES: &[i64] = &[64, 80, 96, 112, 128, 256];

/// Heavy operations worth moving to the device regardless of batch size.
pub const OFFLOAD_OPS: &[Op] = &[
    Op::MulMat,
    Op::MulMatId,
    Op::OutProd,
    Op::Im2Col,
    Op::ConvTranspose1d,
    Op::Rope,
    Op::SoftMax,
    Op::FlashAttnExt,
];

fn is_f32_or_f16(dtype: DType) -> bool {
    matches!(dtype, DType::F32 | DType::F16)
}

fn split_layout_rows_empty(tensor: &Tensor, device: DeviceId) -> bool {
    let Some(buffer) = &tensor.buffer else { return true };
    let Some(layout) = buffer.buffer_type().split_layout() else { return true };
    device >= layout.devices() || layout.rows(tensor, device).is_empty()
}

/// Whether `device` can run `node`.
pub fn supports_op(graph: &Graph, node: TensorId, device: DeviceId) -> bool {
    let t = &graph[node];
    if t.buffer_kind() == Some(BufferKind::Split) {
        return false;
    }
    for (i, src) in t.src.iter().enumerate() {
        let Some(src) = src.map(|id| &graph[id]) else { continue };
        match src.buffer_kind() {
            Some(BufferKind::Split) => {
                if !(t.op == Op::MulMat && i == 0) {
                    return false;
                }
                if src.ne[2] > 1 || src.ne[3] > 1 || split_layout_rows_empty(src, device) {
                    return false;
                }
            }
            Some(BufferKind::Device(d)) if d != device => return false,
            _ => {}
        }
    }
    if matches!(t.buffer_kind(), Some(BufferKind::Device(d)) if d != device) {
        return false;
    }
    op_table(graph, t)
}

fn src<'a>(graph: &'a Graph, t: &Tensor, i: usize) -> Option<&'a Tensor> {
    t.src[i].map(|id| &graph[id])
}

/// Per operation type and layout constraints of the kernel library.
pub fn op_table(graph: &Graph, t: &Tensor) -> bool {
    let Some(a) = src(graph, t, 0) else {
        // Leaves and generators
        return matches!(t.op, Op::None | Op::Arange);
    };
    let b = src(graph, t, 1);
    match t.op {
        Op::Unary(_) => a.is_contiguous() && is_f32_or_f16(a.dtype),
        Op::MulMat | Op::MulMatId => {
            let Some(b) = b else { return false };
            if t.op == Op::MulMat && !can_mul_mat(a, b) {
                return false;
            }
            if a.ne[3] != b.ne[3] || a.dtype == DType::BF16 || !is_f32_or_f16(b.dtype) {
                return false;
            }
            // No kernels for vector products with iq types in batched mode
            !(a.dtype.is_iq() && b.ne[1] == 1 && b.nrows() > 1)
        }
        Op::OutProd => {
            let Some(b) = b else { return false };
            a.dtype == DType::F32 && b.dtype == DType::F32 && a.ne[2] == 1 && a.ne[3] == 1
        }
        Op::GetRows => b.is_some_and(|b| b.dtype == DType::I32) && GET_ROWS_TYPES.contains(&a.dtype),
        Op::Cpy => {
            let Some(b) = b else { return false };
            (a.dtype == b.dtype && a.is_contiguous() && b.is_contiguous()) || CPY_PAIRS.contains(&(a.dtype, b.dtype))
        }
        Op::Concat => !matches!(a.dtype, DType::I32 | DType::I16),
        Op::Dup
        | Op::Argmax
        | Op::None
        | Op::Reshape
        | Op::Repeat
        | Op::View
        | Op::Permute
        | Op::Transpose
        | Op::Scale
        | Op::DiagMaskInf
        | Op::Im2Col
        | Op::Pool2d
        | Op::Sum
        | Op::SumRows
        | Op::Mean
        | Op::Argsort
        | Op::Acc
        | Op::Pad
        | Op::LeakyRelu
        | Op::TimestepEmbedding
        | Op::Arange
        | Op::RwkvWkv6
        | Op::RwkvWkv7
        | Op::GatedLinearAttn => true,
        Op::Add | Op::Add1 | Op::Sub | Op::Mul | Op::Div => {
            is_f32_or_f16(a.dtype) && b.map_or(true, |b| is_f32_or_f16(b.dtype))
        }
        Op::Sqr | Op::Sqrt | Op::Sin | Op::Cos | Op::Clamp | Op::Log => is_f32_or_f16(a.dtype),
        Op::Norm | Op::RmsNorm | Op::GroupNorm | Op::L2Norm => a.is_contiguous(),
        Op::Cont => a.dtype != DType::BF16,
        Op::SoftMax => a.dtype == DType::F32 && b.map_or(true, |m| is_f32_or_f16(m.dtype)),
        // Multi section rope is not implemented
        Op::Rope => a.is_contiguous() && t.op_params[2] & 8 == 0,
        // Only nearest neighbour upscaling
        Op::Upscale => a.dtype == DType::F32 && t.op_params[0] == 0,
        Op::ConvTranspose1d | Op::SsmConv => {
            a.dtype == DType::F32 && b.is_some_and(|b| b.dtype == DType::F32) && t.dtype == DType::F32
        }
        Op::FlashAttnExt => {
            let (Some(k), Some(v)) = (b, src(graph, t, 2)) else { return false };
            a.dtype == DType::F32
                && is_f32_or_f16(k.dtype)
                && is_f32_or_f16(v.dtype)
                && FLASH_ATTN_HEAD_SIZES.contains(&a.ne[0])
                && k.ne[0] == v.ne[0]
        }
        Op::SsmScan | Op::Set => false,
    }
}

/// Whether the host runtime should move `node` to this device even if its inputs live elsewhere.
pub fn offload_op(t: &Tensor, min_batch: i64) -> bool {
    let batch = match t.op {
        Op::GetRows => 0,
        Op::MulMatId => t.ne[2],
        _ => t.ne[1],
    };
    batch >= min_batch || OFFLOAD_OPS.contains(&t.op)
}

/// `b` can be multiplied by `a`: equal inner dimension and `a`'s batches broadcast over `b`'s.
pub fn can_mul_mat(a: &Tensor, b: &Tensor) -> bool {
    a.ne[0] == b.ne[0] && (2..4).all(|i| a.ne[i] > 0 && b.ne[i] % a.ne[i] == 0)
}

/// Whether tensors in buffers of `kind` can be used by `device`.
pub fn supports_buft(kind: BufferKind, device: DeviceId) -> bool {
    match kind {
        BufferKind::Device(d) => d == device,
        BufferKind::Split => true,
        BufferKind::Host { .. } => false,
    }
}
