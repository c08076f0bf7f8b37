//! Memory of one device.

use std::sync::Arc;

use super::{check_range, Buffer, BufferContext, BufferKind, BufferType, BufferUsage};
use crate::{
    context::DeviceContext,
    copy::{CopyMode, CopyNegotiator},
    driver::DevicePtr,
    error::{BackendError, ErrorStatus},
    tensor::Tensor,
    DeviceId, MATRIX_ROW_PADDING,
};

/// Extra bytes past a quantized tensor so kernels can read whole padded rows.
pub(crate) fn quantized_padding(tensor: &Tensor) -> usize {
    let ne0 = tensor.ne[0];
    if tensor.dtype.is_quantized() && ne0 % MATRIX_ROW_PADDING != 0 {
        tensor.dtype.row_size(MATRIX_ROW_PADDING - ne0 % MATRIX_ROW_PADDING)
    } else {
        0
    }
}

#[derive(Debug)]
pub struct DeviceBufferType {
    device: DeviceId,
    name: String,
    total_memory: usize,
    transfer: Arc<DeviceContext>,
}

impl DeviceBufferType {
    /// `transfer` provides the queues used for host transfers and copies into these buffers.
    pub(crate) fn new(device: DeviceId, total_memory: usize, transfer: Arc<DeviceContext>) -> DeviceBufferType {
        DeviceBufferType { device, name: format!("XPU{device}"), total_memory, transfer }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }
}

impl BufferType for DeviceBufferType {
    fn name(&self) -> &str {
        &self.name
    }

    fn alloc_buffer(self: Arc<Self>, size: usize) -> Result<Buffer, BackendError> {
        // Zero sized requests still get a real allocation
        let bytes = size.max(1);
        let device = self.device;
        let ptr = match self.transfer.driver().alloc(device, bytes) {
            Ok(ptr) => ptr,
            Err(e) => {
                tracing::error!(target: "xpu::memory", device, "allocating {:.2} MiB failed", bytes as f64 / 1024.0 / 1024.0);
                return Err(e.on_device(device));
            }
        };
        verbose!(self.transfer.config().debug_mem(), "xpu::memory", device, bytes, ptr = ptr.0, "allocated device buffer");
        let context = DeviceBuffer { device, ptr, size: bytes, transfer: self.transfer.clone() };
        Ok(Buffer::new(self, size, Box::new(context)))
    }

    fn max_size(&self) -> usize {
        self.total_memory
    }

    fn alloc_size(&self, tensor: &Tensor) -> usize {
        tensor.nbytes() + quantized_padding(tensor)
    }

    fn kind(&self) -> BufferKind {
        BufferKind::Device(self.device)
    }
}

#[derive(Debug)]
pub struct DeviceBuffer {
    device: DeviceId,
    ptr: DevicePtr,
    size: usize,
    transfer: Arc<DeviceContext>,
}

impl DeviceBuffer {
    fn check(&self, tensor: &Tensor, offset: usize, len: usize) -> Result<(), BackendError> {
        check_range(self.ptr, self.size, tensor, offset, len).map_err(|e| e.on_device(self.device))
    }

    fn sync(&self) -> Result<(), BackendError> {
        self.transfer.synchronize(self.device)
    }
}

impl BufferContext for DeviceBuffer {
    fn base(&self) -> DevicePtr {
        self.ptr
    }

    fn kind(&self) -> BufferKind {
        BufferKind::Device(self.device)
    }

    fn init_tensor(&self, usage: BufferUsage, tensor: &mut Tensor) -> Result<(), BackendError> {
        if tensor.is_view() {
            debug_assert!(tensor.buffer.as_ref().is_some_and(|b| b.kind() == self.kind()));
            return Ok(());
        }
        let padding = quantized_padding(tensor);
        if padding > 0 && usage != BufferUsage::Weights {
            let start = tensor.data.offset(tensor.nbytes());
            if start.0 + padding as u64 > self.ptr.0 + self.size as u64 {
                return Err(BackendError::new(
                    ErrorStatus::InvalidTensor,
                    format!("padding of tensor '{}' does not fit into its buffer", tensor.name),
                )
                .on_device(self.device));
            }
            let queue = self.transfer.queue(self.device)?;
            self.transfer
                .driver()
                .memset_async(self.device, start, 0, padding, queue.handle())
                .map_err(|e| e.on_device(self.device))?;
            self.sync()?;
        }
        Ok(())
    }

    fn set_tensor(&self, tensor: &Tensor, data: &[u8], offset: usize) -> Result<(), BackendError> {
        self.check(tensor, offset, data.len())?;
        let queue = self.transfer.queue(self.device)?;
        // SAFETY: `data` outlives the copy, the queue is synchronized before returning
        unsafe {
            self.transfer.driver().memcpy_htod_async(
                self.device,
                tensor.data.offset(offset),
                data.as_ptr(),
                data.len(),
                queue.handle(),
            )
        }
        .map_err(|e| e.on_device(self.device))?;
        self.sync()
    }

    fn get_tensor(&self, tensor: &Tensor, data: &mut [u8], offset: usize) -> Result<(), BackendError> {
        self.check(tensor, offset, data.len())?;
        let queue = self.transfer.queue(self.device)?;
        // SAFETY: `data` outlives the copy, the queue is synchronized before returning
        unsafe {
            self.transfer.driver().memcpy_dtoh_async(
                self.device,
                data.as_mut_ptr(),
                tensor.data.offset(offset),
                data.len(),
                queue.handle(),
            )
        }
        .map_err(|e| e.on_device(self.device))?;
        self.sync()
    }

    fn memset_tensor(&self, tensor: &Tensor, value: u8, offset: usize, size: usize) -> Result<(), BackendError> {
        self.check(tensor, offset, size)?;
        let queue = self.transfer.queue(self.device)?;
        self.transfer
            .driver()
            .memset_async(self.device, tensor.data.offset(offset), value, size, queue.handle())
            .map_err(|e| e.on_device(self.device))?;
        self.sync()
    }

    fn cpy_tensor(&self, src: &Tensor, dst: &Tensor) -> Result<bool, BackendError> {
        if matches!(src.buffer_kind(), Some(BufferKind::Device(_))) {
            CopyNegotiator::new(&self.transfer).copy_tensor(src, dst, CopyMode::Sync)
        } else {
            Ok(false)
        }
    }

    fn clear(&self, value: u8) -> Result<(), BackendError> {
        let queue = self.transfer.queue(self.device)?;
        self.transfer
            .driver()
            .memset_async(self.device, self.ptr, value, self.size, queue.handle())
            .map_err(|e| e.on_device(self.device))?;
        self.sync()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        verbose!(self.transfer.config().debug_mem(), "xpu::memory", device = self.device, size = self.size, "freeing device buffer");
        if let Err(e) = self.transfer.driver().free(self.device, self.ptr) {
            tracing::warn!(target: "xpu::memory", "{}", e.on_device(self.device));
        }
    }
}
