//! Buffer types and buffers.
//!
//! A [`BufferType`] allocates [`Buffer`]s, each buffer owns one [`BufferContext`] that knows how
//! the memory is laid out: one region on one device, row slices on several devices, or host memory.

pub mod device;
pub mod host;
pub mod split;

use std::sync::Arc;

use crate::{
    driver::DevicePtr,
    error::{BackendError, ErrorStatus},
    split::SplitLayout,
    tensor::Tensor,
    DeviceId, TENSOR_ALIGNMENT,
};

/// Where the memory of a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Device(DeviceId),
    Split,
    Host { pinned: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferUsage {
    #[default]
    Any,
    /// Filled once by `set_tensor`, padding is written by the host runtime
    Weights,
    Compute,
}

pub trait BufferType: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn alloc_buffer(self: Arc<Self>, size: usize) -> Result<Buffer, BackendError>;

    fn alignment(&self) -> usize {
        TENSOR_ALIGNMENT
    }

    fn max_size(&self) -> usize {
        usize::MAX
    }

    /// Bytes a tensor takes in buffers of this type, including padding
    fn alloc_size(&self, tensor: &Tensor) -> usize {
        tensor.nbytes()
    }

    fn is_host(&self) -> bool {
        false
    }

    fn kind(&self) -> BufferKind;

    /// Row split used by split buffer types
    fn split_layout(&self) -> Option<&SplitLayout> {
        None
    }
}

/// Memory behind a [`Buffer`]. Released when dropped.
pub trait BufferContext: Send + Sync + std::fmt::Debug {
    fn base(&self) -> DevicePtr;
    fn kind(&self) -> BufferKind;
    fn init_tensor(&self, usage: BufferUsage, tensor: &mut Tensor) -> Result<(), BackendError>;
    fn set_tensor(&self, tensor: &Tensor, data: &[u8], offset: usize) -> Result<(), BackendError>;
    fn get_tensor(&self, tensor: &Tensor, data: &mut [u8], offset: usize) -> Result<(), BackendError>;
    fn memset_tensor(&self, tensor: &Tensor, value: u8, offset: usize, size: usize) -> Result<(), BackendError>;
    /// Copies `src` into `dst`, which lives in this buffer. `Ok(false)` if this buffer can not do it.
    fn cpy_tensor(&self, src: &Tensor, dst: &Tensor) -> Result<bool, BackendError>;
    fn clear(&self, value: u8) -> Result<(), BackendError>;
}

#[derive(Debug)]
pub struct Buffer {
    buft: Arc<dyn BufferType>,
    size: usize,
    usage: BufferUsage,
    context: Box<dyn BufferContext>,
}

impl Buffer {
    pub(crate) fn new(buft: Arc<dyn BufferType>, size: usize, context: Box<dyn BufferContext>) -> Buffer {
        Buffer { buft, size, usage: BufferUsage::Any, context }
    }

    pub fn buffer_type(&self) -> &Arc<dyn BufferType> {
        &self.buft
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn set_usage(&mut self, usage: BufferUsage) {
        self.usage = usage;
    }

    #[must_use]
    pub fn with_usage(mut self, usage: BufferUsage) -> Buffer {
        self.usage = usage;
        self
    }

    /// Base address. For split buffers this is a placeholder that must never be dereferenced,
    /// the per device pointers are in the tensor's split table.
    pub fn base(&self) -> DevicePtr {
        self.context.base()
    }

    pub fn kind(&self) -> BufferKind {
        self.context.kind()
    }

    pub fn is_host(&self) -> bool {
        self.buft.is_host()
    }

    pub fn init_tensor(&self, tensor: &mut Tensor) -> Result<(), BackendError> {
        self.context.init_tensor(self.usage, tensor)
    }

    pub fn set_tensor(&self, tensor: &Tensor, data: &[u8], offset: usize) -> Result<(), BackendError> {
        self.check_binding(tensor)?;
        self.context.set_tensor(tensor, data, offset)
    }

    pub fn get_tensor(&self, tensor: &Tensor, data: &mut [u8], offset: usize) -> Result<(), BackendError> {
        self.check_binding(tensor)?;
        self.context.get_tensor(tensor, data, offset)
    }

    pub fn memset_tensor(&self, tensor: &Tensor, value: u8, offset: usize, size: usize) -> Result<(), BackendError> {
        self.check_binding(tensor)?;
        self.context.memset_tensor(tensor, value, offset, size)
    }

    /// Copies `src` into `dst`, `dst` must be bound to this buffer.
    pub fn cpy_tensor(&self, src: &Tensor, dst: &Tensor) -> Result<bool, BackendError> {
        self.check_binding(dst)?;
        self.context.cpy_tensor(src, dst)
    }

    pub fn clear(&self, value: u8) -> Result<(), BackendError> {
        self.context.clear(value)
    }

    fn check_binding(&self, tensor: &Tensor) -> Result<(), BackendError> {
        match &tensor.buffer {
            Some(b) if std::ptr::eq(b.as_ref(), self) => Ok(()),
            _ => Err(BackendError::new(
                ErrorStatus::InvalidBuffer,
                format!("tensor '{}' is not bound to this {} buffer", tensor.name, self.buft.name()),
            )),
        }
    }
}

/// Checks that `len` bytes at `offset` into `tensor` stay inside the tensor and inside the
/// `size` bytes starting at `base`.
pub(crate) fn check_range(
    base: DevicePtr,
    size: usize,
    tensor: &Tensor,
    offset: usize,
    len: usize,
) -> Result<(), BackendError> {
    let start = tensor.data.0.checked_add(offset as u64);
    let end = start.and_then(|s| s.checked_add(len as u64));
    let in_tensor = offset.checked_add(len).is_some_and(|e| e <= tensor.nbytes());
    match (start, end) {
        (Some(start), Some(end)) if in_tensor && start >= base.0 && end <= base.0 + size as u64 => Ok(()),
        _ => Err(BackendError::new(
            ErrorStatus::InvalidTensor,
            format!(
                "{len} B at offset {offset} of tensor '{}' ({} B) is outside its buffer",
                tensor.name,
                tensor.nbytes()
            ),
        )),
    }
}

/// Places tensors one after another into a single buffer.
#[derive(Debug)]
pub struct TensorAllocator {
    buffer: Arc<Buffer>,
    offset: usize,
}

impl TensorAllocator {
    pub fn new(buffer: Arc<Buffer>) -> TensorAllocator {
        let offset = buffer.base().0 as usize % buffer.buffer_type().alignment();
        let offset = if offset == 0 { 0 } else { buffer.buffer_type().alignment() - offset };
        TensorAllocator { buffer, offset }
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Binds a tensor to the next free aligned region. Views are bound to their source instead.
    pub fn alloc(&mut self, graph: &mut crate::Graph, id: crate::TensorId) -> Result<(), BackendError> {
        if graph[id].is_view() {
            return graph.init_view(id);
        }
        let buft = self.buffer.buffer_type();
        let size = buft.alloc_size(&graph[id]);
        let alignment = buft.alignment();
        if self.offset + size > self.buffer.size() {
            return Err(BackendError::new(
                ErrorStatus::MemoryAllocation,
                format!(
                    "not enough space in {} buffer for tensor '{}', needed {size} B, available {} B",
                    buft.name(),
                    graph[id].name,
                    self.buffer.size() - self.offset.min(self.buffer.size())
                ),
            ));
        }
        let tensor = &mut graph[id];
        tensor.buffer = Some(self.buffer.clone());
        tensor.data = self.buffer.base().offset(self.offset);
        if let Err(e) = self.buffer.init_tensor(tensor) {
            tensor.buffer = None;
            tensor.data = DevicePtr::NULL;
            return Err(e);
        }
        self.offset += size.div_ceil(alignment) * alignment;
        Ok(())
    }
}
