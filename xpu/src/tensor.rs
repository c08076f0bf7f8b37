//! Tensor descriptors as handed over by the host runtime.

use std::sync::Arc;

use crate::{
    buffer::{split::SplitTensor, Buffer, BufferKind},
    driver::DevicePtr,
    DType, MAX_DIMS, MAX_OP_PARAMS, MAX_SRC,
};

/// Index of a tensor inside its [`Graph`](crate::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId(pub(crate) u32);

impl TensorId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Abs,
    Sgn,
    Neg,
    Step,
    Tanh,
    Elu,
    Relu,
    Sigmoid,
    Gelu,
    GeluQuick,
    Silu,
    HardSwish,
    HardSigmoid,
    Exp,
}

/// Operation that produced a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    None,
    Dup,
    Add,
    Add1,
    Acc,
    Sub,
    Mul,
    Div,
    Sqr,
    Sqrt,
    Log,
    Sin,
    Cos,
    Sum,
    SumRows,
    Mean,
    Argmax,
    Repeat,
    Concat,
    Norm,
    RmsNorm,
    GroupNorm,
    L2Norm,
    MulMat,
    MulMatId,
    OutProd,
    Scale,
    Set,
    Cpy,
    Cont,
    Reshape,
    View,
    Permute,
    Transpose,
    GetRows,
    DiagMaskInf,
    SoftMax,
    Rope,
    Clamp,
    ConvTranspose1d,
    Im2Col,
    Pool2d,
    Upscale,
    Pad,
    Arange,
    TimestepEmbedding,
    Argsort,
    LeakyRelu,
    FlashAttnExt,
    SsmConv,
    SsmScan,
    RwkvWkv6,
    RwkvWkv7,
    GatedLinearAttn,
    Unary(UnaryOp),
}

impl Op {
    /// Operations that only reinterpret an existing binding and issue no device work.
    pub fn is_layout(self) -> bool {
        matches!(self, Op::None | Op::Reshape | Op::View | Op::Permute | Op::Transpose)
    }
}

/// Logical tensor with up to four dimensions.
///
/// `ne` are extents, `nb` byte strides. `ne[0]` is the innermost (row) dimension.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub name: String,
    pub op: Op,
    pub op_params: [i32; MAX_OP_PARAMS],
    pub dtype: DType,
    pub ne: [i64; MAX_DIMS],
    pub nb: [usize; MAX_DIMS],
    pub src: [Option<TensorId>; MAX_SRC],
    /// Tensor this one aliases, never owned
    pub view_src: Option<TensorId>,
    pub view_offs: usize,
    pub buffer: Option<Arc<Buffer>>,
    /// Address of the first element inside `buffer`'s address space
    pub data: DevicePtr,
    /// Per device pointer table, only set for tensors bound to a split buffer
    pub extra: Option<Arc<SplitTensor>>,
}

impl Tensor {
    /// New contiguous tensor with no producer. Missing trailing dimensions are 1.
    pub fn new(dtype: DType, shape: &[i64]) -> Tensor {
        assert!(!shape.is_empty() && shape.len() <= MAX_DIMS, "tensors have 1 to {MAX_DIMS} dimensions");
        let mut ne = [1; MAX_DIMS];
        ne[..shape.len()].copy_from_slice(shape);
        Tensor {
            name: String::new(),
            op: Op::None,
            op_params: [0; MAX_OP_PARAMS],
            dtype,
            ne,
            nb: contiguous_strides(dtype, ne),
            src: [None; MAX_SRC],
            view_src: None,
            view_offs: 0,
            buffer: None,
            data: DevicePtr::NULL,
            extra: None,
        }
    }

    pub fn nelements(&self) -> i64 {
        self.ne.iter().product()
    }

    pub fn nrows(&self) -> i64 {
        self.ne[1] * self.ne[2] * self.ne[3]
    }

    /// Bytes spanned by the tensor, taking strides into account.
    pub fn nbytes(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let block_size = self.dtype.block_size();
        let (mut bytes, first) = if block_size == 1 {
            (self.dtype.type_size(), 0)
        } else {
            (self.ne[0] as usize * self.nb[0] / block_size, 1)
        };
        for i in first..MAX_DIMS {
            bytes += (self.ne[i] as usize - 1) * self.nb[i];
        }
        bytes
    }

    pub fn row_size(&self) -> usize {
        self.dtype.row_size(self.ne[0])
    }

    pub fn is_empty(&self) -> bool {
        self.ne.iter().any(|&n| n == 0)
    }

    pub fn is_view(&self) -> bool {
        self.view_src.is_some()
    }

    /// True if elements are laid out densely in row major order.
    /// Dimensions of extent 1 may have any stride.
    pub fn is_contiguous(&self) -> bool {
        let block_size = self.dtype.block_size() as i64;
        let mut next_nb = self.dtype.type_size();
        if self.ne[0] != block_size && self.nb[0] != next_nb {
            return false;
        }
        next_nb *= (self.ne[0] / block_size) as usize;
        for i in 1..MAX_DIMS {
            if self.ne[i] != 1 {
                if self.nb[i] != next_nb {
                    return false;
                }
                next_nb *= self.ne[i] as usize;
            }
        }
        true
    }

    pub fn op_param_f32(&self, i: usize) -> f32 {
        f32::from_bits(self.op_params[i] as u32)
    }

    pub fn set_op_param_f32(&mut self, i: usize, value: f32) {
        self.op_params[i] = value.to_bits() as i32;
    }

    pub fn sources(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.src.iter().flatten().copied()
    }

    /// Kind of buffer this tensor is bound to, `None` while unbound.
    pub fn buffer_kind(&self) -> Option<BufferKind> {
        self.buffer.as_ref().map(|b| b.kind())
    }
}

pub(crate) fn contiguous_strides(dtype: DType, ne: [i64; MAX_DIMS]) -> [usize; MAX_DIMS] {
    let mut nb = [0; MAX_DIMS];
    nb[0] = dtype.type_size();
    nb[1] = nb[0] * (ne[0] as usize / dtype.block_size());
    for i in 2..MAX_DIMS {
        nb[i] = nb[i - 1] * ne[i - 1] as usize;
    }
    nb
}
