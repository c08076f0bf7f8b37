//! Page locked host memory with plain host memory as fallback.

use std::{alloc::Layout, ptr::NonNull, sync::Arc};

use super::{check_range, Buffer, BufferContext, BufferKind, BufferType, BufferUsage};
use crate::{
    context::DeviceContext,
    copy::{CopyMode, CopyNegotiator},
    driver::DevicePtr,
    error::{BackendError, ErrorStatus},
    tensor::Tensor,
    TENSOR_ALIGNMENT,
};

#[derive(Debug)]
pub struct HostBufferType {
    transfer: Arc<DeviceContext>,
}

impl HostBufferType {
    pub(crate) fn new(transfer: Arc<DeviceContext>) -> HostBufferType {
        HostBufferType { transfer }
    }
}

impl BufferType for HostBufferType {
    fn name(&self) -> &str {
        "XPU_Host"
    }

    fn alloc_buffer(self: Arc<Self>, size: usize) -> Result<Buffer, BackendError> {
        let bytes = size.max(1);
        let (ptr, memory) = match self.transfer.driver().host_alloc_pinned(bytes).map(NonNull::new) {
            Ok(Some(ptr)) => (ptr, HostMemory::Pinned),
            Ok(None) | Err(_) => {
                tracing::warn!(
                    target: "xpu::memory",
                    "failed to allocate {:.2} MiB of pinned memory, using plain host memory",
                    bytes as f64 / 1024.0 / 1024.0
                );
                let layout = Layout::from_size_align(bytes, TENSOR_ALIGNMENT).map_err(|e| {
                    BackendError::new(ErrorStatus::MemoryAllocation, format!("invalid host buffer layout: {e}"))
                })?;
                // SAFETY: layout has non zero size
                let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).ok_or_else(|| {
                    BackendError::new(ErrorStatus::MemoryAllocation, format!("failed to allocate {bytes} B of host memory"))
                })?;
                (ptr, HostMemory::Plain(layout))
            }
        };
        verbose!(
            self.transfer.config().debug_mem(),
            "xpu::memory",
            bytes,
            pinned = matches!(memory, HostMemory::Pinned),
            "allocated host buffer"
        );
        let context = HostBuffer { ptr, size: bytes, memory, transfer: self.transfer.clone() };
        Ok(Buffer::new(self, size, Box::new(context)))
    }

    fn is_host(&self) -> bool {
        true
    }

    fn kind(&self) -> BufferKind {
        BufferKind::Host { pinned: true }
    }
}

#[derive(Debug)]
enum HostMemory {
    Pinned,
    Plain(Layout),
}

#[derive(Debug)]
pub struct HostBuffer {
    ptr: NonNull<u8>,
    size: usize,
    memory: HostMemory,
    transfer: Arc<DeviceContext>,
}

// SAFETY: the allocation is owned by this buffer, access goes through range checked copies
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    fn base_ptr(&self) -> DevicePtr {
        DevicePtr(self.ptr.as_ptr() as u64)
    }

    /// Host address of `len` bytes at `offset` into `tensor`, range checked.
    fn address(&self, tensor: &Tensor, offset: usize, len: usize) -> Result<*mut u8, BackendError> {
        check_range(self.base_ptr(), self.size, tensor, offset, len)?;
        Ok(tensor.data.offset(offset).0 as *mut u8)
    }
}

impl BufferContext for HostBuffer {
    fn base(&self) -> DevicePtr {
        self.base_ptr()
    }

    fn kind(&self) -> BufferKind {
        BufferKind::Host { pinned: matches!(self.memory, HostMemory::Pinned) }
    }

    fn init_tensor(&self, _usage: BufferUsage, _tensor: &mut Tensor) -> Result<(), BackendError> {
        Ok(())
    }

    fn set_tensor(&self, tensor: &Tensor, data: &[u8], offset: usize) -> Result<(), BackendError> {
        let dst = self.address(tensor, offset, data.len())?;
        // SAFETY: dst range lies inside this buffer
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    fn get_tensor(&self, tensor: &Tensor, data: &mut [u8], offset: usize) -> Result<(), BackendError> {
        let src = self.address(tensor, offset, data.len())?;
        // SAFETY: src range lies inside this buffer
        unsafe { std::ptr::copy_nonoverlapping(src, data.as_mut_ptr(), data.len()) };
        Ok(())
    }

    fn memset_tensor(&self, tensor: &Tensor, value: u8, offset: usize, size: usize) -> Result<(), BackendError> {
        let dst = self.address(tensor, offset, size)?;
        // SAFETY: dst range lies inside this buffer
        unsafe { std::ptr::write_bytes(dst, value, size) };
        Ok(())
    }

    fn cpy_tensor(&self, src: &Tensor, dst: &Tensor) -> Result<bool, BackendError> {
        match src.buffer_kind() {
            Some(BufferKind::Host { .. } | BufferKind::Device(_)) => {
                CopyNegotiator::new(&self.transfer).copy_tensor(src, dst, CopyMode::Sync)
            }
            _ => Ok(false),
        }
    }

    fn clear(&self, value: u8) -> Result<(), BackendError> {
        // SAFETY: the whole allocation belongs to this buffer
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), value, self.size) };
        Ok(())
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        match self.memory {
            HostMemory::Pinned => {
                if let Err(e) = self.transfer.driver().host_free_pinned(self.ptr.as_ptr()) {
                    tracing::warn!(target: "xpu::memory", "{e}");
                }
            }
            // SAFETY: allocated with this layout in `alloc_buffer`
            HostMemory::Plain(layout) => unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) },
        }
    }
}
