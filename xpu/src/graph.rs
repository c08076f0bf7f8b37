//! Arena of tensors plus the ordered node list consumed by the dispatcher.
//!
//! Graphs are normally built by the host runtime. The builder methods here produce the same
//! shapes and strides a runtime would, so backends can be driven without one.

use std::ops::{Index, IndexMut};

use crate::{
    error::{BackendError, ErrorStatus},
    tensor::{contiguous_strides, Op, Tensor, TensorId, UnaryOp},
    DType, MAX_DIMS,
};

#[derive(Debug, Default)]
pub struct Graph {
    tensors: Vec<Tensor>,
    nodes: Vec<TensorId>,
}

impl Index<TensorId> for Graph {
    type Output = Tensor;
    fn index(&self, index: TensorId) -> &Tensor {
        &self.tensors[index.index()]
    }
}

impl IndexMut<TensorId> for Graph {
    fn index_mut(&mut self, index: TensorId) -> &mut Tensor {
        &mut self.tensors[index.index()]
    }
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn push(&mut self, tensor: Tensor) -> TensorId {
        debug_assert!(self.tensors.len() < u32::MAX as usize);
        let id = TensorId(self.tensors.len() as u32);
        self.tensors.push(tensor);
        id
    }

    /// New leaf tensor
    pub fn tensor(&mut self, dtype: DType, shape: &[i64]) -> TensorId {
        self.push(Tensor::new(dtype, shape))
    }

    pub fn ids(&self) -> impl Iterator<Item = TensorId> {
        (0..self.tensors.len() as u32).map(TensorId)
    }

    pub fn nodes(&self) -> &[TensorId] {
        &self.nodes
    }

    pub fn push_node(&mut self, id: TensorId) {
        self.nodes.push(id);
    }

    /// Appends `output` and every not yet listed producer it depends on, producers first.
    /// Leaves are not nodes.
    pub fn build_forward(&mut self, output: TensorId) {
        let mut stack = vec![(output, false)];
        while let Some((id, expanded)) = stack.pop() {
            if self.nodes.contains(&id) {
                continue;
            }
            let tensor = &self[id];
            if expanded {
                if tensor.op != Op::None {
                    self.nodes.push(id);
                }
                continue;
            }
            stack.push((id, true));
            let sources: Vec<TensorId> = tensor.sources().collect();
            for src in sources.into_iter().rev() {
                stack.push((src, false));
            }
            // views depend on whatever produced their storage
            if let Some(view_src) = tensor.view_src {
                stack.push((view_src, false));
            }
        }
    }

    /// New contiguous tensor produced by `op` from `srcs`.
    pub fn op(&mut self, op: Op, dtype: DType, shape: &[i64], srcs: &[TensorId]) -> TensorId {
        let mut tensor = Tensor::new(dtype, shape);
        tensor.op = op;
        for (slot, &src) in tensor.src.iter_mut().zip(srcs) {
            *slot = Some(src);
        }
        self.push(tensor)
    }

    fn same_shape(&mut self, op: Op, a: TensorId, srcs: &[TensorId]) -> TensorId {
        let (dtype, ne) = (self[a].dtype, self[a].ne);
        self.op(op, dtype, &ne, srcs)
    }

    pub fn add(&mut self, a: TensorId, b: TensorId) -> TensorId {
        self.same_shape(Op::Add, a, &[a, b])
    }

    pub fn sub(&mut self, a: TensorId, b: TensorId) -> TensorId {
        self.same_shape(Op::Sub, a, &[a, b])
    }

    pub fn mul(&mut self, a: TensorId, b: TensorId) -> TensorId {
        self.same_shape(Op::Mul, a, &[a, b])
    }

    pub fn div(&mut self, a: TensorId, b: TensorId) -> TensorId {
        self.same_shape(Op::Div, a, &[a, b])
    }

    pub fn sqr(&mut self, a: TensorId) -> TensorId {
        self.same_shape(Op::Sqr, a, &[a])
    }

    pub fn sqrt(&mut self, a: TensorId) -> TensorId {
        self.same_shape(Op::Sqrt, a, &[a])
    }

    pub fn unary(&mut self, a: TensorId, op: UnaryOp) -> TensorId {
        self.same_shape(Op::Unary(op), a, &[a])
    }

    pub fn scale(&mut self, a: TensorId, s: f32) -> TensorId {
        let id = self.same_shape(Op::Scale, a, &[a]);
        self[id].set_op_param_f32(0, s);
        id
    }

    pub fn soft_max(&mut self, a: TensorId, scale: f32) -> TensorId {
        let id = self.same_shape(Op::SoftMax, a, &[a]);
        self[id].set_op_param_f32(0, scale);
        id
    }

    pub fn rms_norm(&mut self, a: TensorId, eps: f32) -> TensorId {
        let id = self.same_shape(Op::RmsNorm, a, &[a]);
        self[id].set_op_param_f32(0, eps);
        id
    }

    /// Contiguous copy of `a`
    pub fn cont(&mut self, a: TensorId) -> TensorId {
        self.same_shape(Op::Cont, a, &[a])
    }

    pub fn dup(&mut self, a: TensorId) -> TensorId {
        self.same_shape(Op::Dup, a, &[a])
    }

    /// `a` times `b` transposed. `a` is `[k, n, ..]`, `b` is `[k, m, ..]`, result is `[n, m, ..]` in f32.
    pub fn mul_mat(&mut self, a: TensorId, b: TensorId) -> TensorId {
        let (na, nb) = (self[a].ne, self[b].ne);
        debug_assert_eq!(na[0], nb[0], "mul_mat inner dimensions differ");
        self.op(Op::MulMat, DType::F32, &[na[1], nb[1], nb[2], nb[3]], &[a, b])
    }

    /// Gathers rows of `a` selected by i32 indices in `rows`.
    pub fn get_rows(&mut self, a: TensorId, rows: TensorId) -> TensorId {
        let (na, nr) = (self[a].ne, self[rows].ne);
        self.op(Op::GetRows, DType::F32, &[na[0], nr[0], nr[1], nr[2]], &[a, rows])
    }

    /// Copies `a` into `b`. The result aliases `b`.
    pub fn cpy(&mut self, a: TensorId, b: TensorId) -> TensorId {
        let (dtype, ne, nb) = (self[b].dtype, self[b].ne, self[b].nb);
        let id = self.view_of(Op::Cpy, b, dtype, ne, nb, 0);
        self[id].src[0] = Some(a);
        self[id].src[1] = Some(b);
        id
    }

    pub fn reshape(&mut self, a: TensorId, shape: &[i64]) -> TensorId {
        debug_assert!(self[a].is_contiguous(), "only contiguous tensors can be reshaped");
        let mut ne = [1; MAX_DIMS];
        ne[..shape.len()].copy_from_slice(shape);
        debug_assert_eq!(ne.iter().product::<i64>(), self[a].nelements());
        let dtype = self[a].dtype;
        self.view_of(Op::Reshape, a, dtype, ne, contiguous_strides(dtype, ne), 0)
    }

    pub fn view(&mut self, a: TensorId, shape: &[i64], nb: &[usize], offset: usize) -> TensorId {
        let mut ne = [1; MAX_DIMS];
        ne[..shape.len()].copy_from_slice(shape);
        let dtype = self[a].dtype;
        let mut strides = contiguous_strides(dtype, ne);
        strides[1..1 + nb.len()].copy_from_slice(nb);
        for i in 1 + nb.len()..MAX_DIMS {
            strides[i] = strides[i - 1] * ne[i - 1] as usize;
        }
        self.view_of(Op::View, a, dtype, ne, strides, offset)
    }

    /// Dimension `i` of `a` becomes dimension `axes[i]` of the result.
    pub fn permute(&mut self, a: TensorId, axes: [usize; MAX_DIMS]) -> TensorId {
        let (src_ne, src_nb, dtype) = (self[a].ne, self[a].nb, self[a].dtype);
        let mut ne = [1; MAX_DIMS];
        let mut nb = [0; MAX_DIMS];
        for i in 0..MAX_DIMS {
            ne[axes[i]] = src_ne[i];
            nb[axes[i]] = src_nb[i];
        }
        self.view_of(Op::Permute, a, dtype, ne, nb, 0)
    }

    pub fn transpose(&mut self, a: TensorId) -> TensorId {
        let id = self.permute(a, [1, 0, 2, 3]);
        self[id].op = Op::Transpose;
        id
    }

    fn view_of(
        &mut self,
        op: Op,
        a: TensorId,
        dtype: DType,
        ne: [i64; MAX_DIMS],
        nb: [usize; MAX_DIMS],
        offset: usize,
    ) -> TensorId {
        // views always point at the tensor that owns the storage
        let (view_src, view_offs) = match self[a].view_src {
            Some(root) => (root, self[a].view_offs + offset),
            None => (a, offset),
        };
        let mut tensor = Tensor::new(dtype, &ne);
        tensor.nb = nb;
        tensor.op = op;
        tensor.src[0] = Some(a);
        tensor.view_src = Some(view_src);
        tensor.view_offs = view_offs;
        self.push(tensor)
    }

    /// Binds a view to the storage of its source. The source must already be bound.
    pub fn init_view(&mut self, id: TensorId) -> Result<(), BackendError> {
        let Some(src) = self[id].view_src else {
            return Err(BackendError::new(ErrorStatus::InvalidTensor, format!("{id:?} is not a view")));
        };
        let (buffer, data) = (self[src].buffer.clone(), self[src].data);
        let Some(buffer) = buffer else {
            return Err(BackendError::new(
                ErrorStatus::InvalidTensor,
                format!("view source {src:?} of {id:?} is not allocated"),
            ));
        };
        let tensor = &mut self[id];
        tensor.data = data.offset(tensor.view_offs);
        tensor.buffer = Some(buffer.clone());
        buffer.init_tensor(tensor)
    }
}
