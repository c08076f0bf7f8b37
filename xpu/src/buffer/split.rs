//! Tensors whose rows are spread over several devices.
//!
//! Split buffers own no memory of their own. Every tensor bound to one gets a slice per
//! device that owns rows of it, allocated in `init_tensor` once the shape is known.

use std::sync::Arc;

use super::{Buffer, BufferContext, BufferKind, BufferType, BufferUsage};
use crate::{
    context::DeviceContext,
    driver::DevicePtr,
    error::{BackendError, ErrorStatus},
    mutex::Mutex,
    split::{RowRange, SplitLayout},
    tensor::Tensor,
    DeviceId,
};

/// Placeholder base address, split buffers have no single base.
const SPLIT_BASE: DevicePtr = DevicePtr(0x1000);

/// One device's rows of a split tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSlice {
    pub ptr: DevicePtr,
    pub rows: RowRange,
    /// Bytes of the rows themselves
    pub data_size: usize,
    /// Allocated bytes including zeroed tail padding
    pub size: usize,
}

/// Per device pointer table of a tensor in a split buffer.
#[derive(Debug)]
pub struct SplitTensor {
    slices: Vec<Option<SplitSlice>>,
}

impl SplitTensor {
    /// Slice of `device`, `None` if that device owns no rows.
    pub fn slice(&self, device: DeviceId) -> Option<&SplitSlice> {
        self.slices.get(device).and_then(Option::as_ref)
    }

    pub fn slices(&self) -> impl Iterator<Item = (DeviceId, &SplitSlice)> {
        self.slices.iter().enumerate().filter_map(|(d, s)| s.as_ref().map(|s| (d, s)))
    }
}

#[derive(Debug)]
pub struct SplitBufferType {
    layout: SplitLayout,
    name: String,
    transfer: Arc<DeviceContext>,
}

impl SplitBufferType {
    pub(crate) fn new(layout: SplitLayout, transfer: Arc<DeviceContext>) -> SplitBufferType {
        SplitBufferType { layout, name: "XPU_Split".into(), transfer }
    }

    pub fn layout(&self) -> &SplitLayout {
        &self.layout
    }
}

impl BufferType for SplitBufferType {
    fn name(&self) -> &str {
        &self.name
    }

    fn alloc_buffer(self: Arc<Self>, size: usize) -> Result<Buffer, BackendError> {
        let context = SplitBuffer {
            layout: self.layout.clone(),
            transfer: self.transfer.clone(),
            tensors: Mutex::new(Vec::new()),
        };
        Ok(Buffer::new(self, size, Box::new(context)))
    }

    fn alloc_size(&self, tensor: &Tensor) -> usize {
        self.layout.alloc_size(tensor)
    }

    fn kind(&self) -> BufferKind {
        BufferKind::Split
    }

    fn split_layout(&self) -> Option<&SplitLayout> {
        Some(&self.layout)
    }
}

#[derive(Debug)]
pub struct SplitBuffer {
    layout: SplitLayout,
    transfer: Arc<DeviceContext>,
    tensors: Mutex<Vec<Arc<SplitTensor>>>,
}

impl SplitBuffer {
    fn table<'a>(&self, tensor: &'a Tensor) -> Result<&'a SplitTensor, BackendError> {
        tensor.extra.as_deref().ok_or_else(|| {
            BackendError::new(ErrorStatus::InvalidTensor, format!("split tensor '{}' was not initialized", tensor.name))
        })
    }

    /// Split tensors are only ever transferred as a whole.
    fn check_whole(&self, tensor: &Tensor, offset: usize, len: usize) -> Result<(), BackendError> {
        if offset == 0 && len == tensor.nbytes() {
            Ok(())
        } else {
            Err(BackendError::new(
                ErrorStatus::InvalidTensor,
                format!(
                    "split tensor '{}' must be transferred whole, got {len} B at offset {offset} of {} B",
                    tensor.name,
                    tensor.nbytes()
                ),
            ))
        }
    }

    fn free_slices(&self, slices: &[Option<SplitSlice>]) {
        for (device, slice) in slices.iter().enumerate() {
            if let Some(slice) = slice {
                if let Err(e) = self.transfer.driver().free(device, slice.ptr) {
                    tracing::warn!(target: "xpu::memory", "{}", e.on_device(device));
                }
            }
        }
    }

    fn alloc_slices(&self, tensor: &Tensor) -> Result<Vec<Option<SplitSlice>>, BackendError> {
        let driver = self.transfer.driver();
        let row_size = tensor.nb[1];
        let mut slices = Vec::with_capacity(self.layout.devices());
        for device in 0..self.layout.devices() {
            let rows = self.layout.rows(tensor, device);
            if rows.is_empty() {
                slices.push(None);
                continue;
            }
            let size = self.layout.slice_size(tensor, device);
            let data_size = rows.rows() as usize * row_size;
            let ptr = match driver.alloc(device, size) {
                Ok(ptr) => ptr,
                Err(e) => {
                    self.free_slices(&slices);
                    return Err(e.on_device(device));
                }
            };
            slices.push(Some(SplitSlice { ptr, rows, data_size, size }));
            if size > data_size {
                let zeroed = self.transfer.queue(device).and_then(|queue| {
                    driver
                        .memset_async(device, ptr.offset(data_size), 0, size - data_size, queue.handle())
                        .map_err(|e| e.on_device(device))
                });
                if let Err(e) = zeroed {
                    self.free_slices(&slices);
                    return Err(e);
                }
            }
            verbose!(
                self.transfer.config().debug_mem(),
                "xpu::memory",
                device,
                low = rows.low,
                high = rows.high,
                size,
                "allocated split slice of '{}'",
                tensor.name
            );
        }
        Ok(slices)
    }

    fn sync_slices(&self, table: &SplitTensor) -> Result<(), BackendError> {
        for (device, _) in table.slices() {
            self.transfer.synchronize(device)?;
        }
        Ok(())
    }
}

impl BufferContext for SplitBuffer {
    fn base(&self) -> DevicePtr {
        SPLIT_BASE
    }

    fn kind(&self) -> BufferKind {
        BufferKind::Split
    }

    fn init_tensor(&self, _usage: BufferUsage, tensor: &mut Tensor) -> Result<(), BackendError> {
        if tensor.is_view() {
            return Err(BackendError::new(
                ErrorStatus::InvalidTensor,
                format!("views of split tensors are not supported, '{}' is a view", tensor.name),
            ));
        }
        if !tensor.is_contiguous() {
            return Err(BackendError::new(
                ErrorStatus::InvalidTensor,
                format!("split tensor '{}' must be contiguous", tensor.name),
            ));
        }
        let slices = self.alloc_slices(tensor)?;
        let table = Arc::new(SplitTensor { slices });
        if let Err(e) = self.sync_slices(&table) {
            self.free_slices(&table.slices);
            return Err(e);
        }
        self.tensors.lock().push(table.clone());
        tensor.extra = Some(table);
        Ok(())
    }

    fn set_tensor(&self, tensor: &Tensor, data: &[u8], offset: usize) -> Result<(), BackendError> {
        self.check_whole(tensor, offset, data.len())?;
        let table = self.table(tensor)?;
        let driver = self.transfer.driver();
        for (device, slice) in table.slices() {
            let start = slice.rows.low as usize * tensor.nb[1];
            let queue = self.transfer.queue(device)?;
            // SAFETY: `data` outlives the copy, every queue is synchronized before returning
            unsafe {
                driver.memcpy_htod_async(device, slice.ptr, data[start..].as_ptr(), slice.data_size, queue.handle())
            }
            .map_err(|e| e.on_device(device))?;
        }
        self.sync_slices(table)
    }

    fn get_tensor(&self, tensor: &Tensor, data: &mut [u8], offset: usize) -> Result<(), BackendError> {
        self.check_whole(tensor, offset, data.len())?;
        let table = self.table(tensor)?;
        let driver = self.transfer.driver();
        for (device, slice) in table.slices() {
            let start = slice.rows.low as usize * tensor.nb[1];
            let queue = self.transfer.queue(device)?;
            // SAFETY: `data` outlives the copy, every queue is synchronized before returning
            unsafe {
                driver.memcpy_dtoh_async(device, data[start..].as_mut_ptr(), slice.ptr, slice.data_size, queue.handle())
            }
            .map_err(|e| e.on_device(device))?;
        }
        self.sync_slices(table)
    }

    fn memset_tensor(&self, tensor: &Tensor, value: u8, offset: usize, size: usize) -> Result<(), BackendError> {
        self.check_whole(tensor, offset, size)?;
        let table = self.table(tensor)?;
        for (device, slice) in table.slices() {
            let queue = self.transfer.queue(device)?;
            self.transfer
                .driver()
                .memset_async(device, slice.ptr, value, slice.data_size, queue.handle())
                .map_err(|e| e.on_device(device))?;
        }
        self.sync_slices(table)
    }

    fn cpy_tensor(&self, _src: &Tensor, _dst: &Tensor) -> Result<bool, BackendError> {
        Ok(false)
    }

    /// Sets the rows of every tensor in this buffer, tail padding stays zero.
    fn clear(&self, value: u8) -> Result<(), BackendError> {
        let tensors = self.tensors.lock();
        for table in tensors.iter() {
            for (device, slice) in table.slices() {
                let queue = self.transfer.queue(device)?;
                self.transfer
                    .driver()
                    .memset_async(device, slice.ptr, value, slice.data_size, queue.handle())
                    .map_err(|e| e.on_device(device))?;
            }
        }
        for table in tensors.iter() {
            self.sync_slices(table)?;
        }
        Ok(())
    }
}

impl Drop for SplitBuffer {
    fn drop(&mut self) {
        for table in self.tensors.lock().iter() {
            self.free_slices(&table.slices);
        }
    }
}
