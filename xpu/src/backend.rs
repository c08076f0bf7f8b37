//! Backend instance bound to one device.

use crate::{
    buffer::{check_range, Buffer, BufferKind},
    context::{DeviceContext, Event},
    copy::{CopyMode, CopyNegotiator},
    dispatch,
    error::{fatal, BackendError, ErrorStatus},
    graph::Graph,
    tensor::Tensor,
    DeviceId,
};

/// Outcome of [`Backend::graph_compute`], mirroring the status codes of host runtimes.
/// Failures never come back as a status, they terminate the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphStatus {
    Success,
}

/// Executes graphs on one device, owns that device's queue, compute handle and pool.
///
/// Dropping the backend synchronizes and releases them.
#[derive(Debug)]
pub struct Backend {
    name: String,
    context: DeviceContext,
}

impl Backend {
    pub(crate) fn new(name: String, context: DeviceContext) -> Backend {
        Backend { name, context }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> DeviceId {
        self.context.device()
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    fn own_buffer<'a>(&self, tensor: &'a Tensor) -> Result<&'a Buffer, BackendError> {
        match &tensor.buffer {
            Some(buffer) if buffer.kind() == BufferKind::Device(self.device()) => Ok(buffer),
            _ => Err(BackendError::new(
                ErrorStatus::InvalidBuffer,
                format!("tensor '{}' is not in a buffer of {}", tensor.name, self.name),
            )
            .on_device(self.device())),
        }
    }

    /// Queues a copy of `data` into `tensor` at `offset`.
    ///
    /// # Safety
    /// `data` must stay valid and unmodified until [`Backend::synchronize`] returns.
    pub unsafe fn set_tensor_async(&self, tensor: &Tensor, data: &[u8], offset: usize) -> Result<(), BackendError> {
        let buffer = self.own_buffer(tensor)?;
        check_range(buffer.base(), buffer.size(), tensor, offset, data.len())?;
        let device = self.device();
        let queue = self.context.queue(device)?;
        // SAFETY: validity of `data` until synchronization is guaranteed by the caller
        unsafe {
            self.context.driver().memcpy_htod_async(
                device,
                tensor.data.offset(offset),
                data.as_ptr(),
                data.len(),
                queue.handle(),
            )
        }
        .map_err(|e| e.on_device(device))
    }

    /// Queues a copy of `tensor` at `offset` into `data`.
    ///
    /// # Safety
    /// `data` must stay valid and must not be accessed until [`Backend::synchronize`] returns.
    pub unsafe fn get_tensor_async(&self, tensor: &Tensor, data: &mut [u8], offset: usize) -> Result<(), BackendError> {
        let buffer = self.own_buffer(tensor)?;
        check_range(buffer.base(), buffer.size(), tensor, offset, data.len())?;
        let device = self.device();
        let queue = self.context.queue(device)?;
        // SAFETY: validity of `data` until synchronization is guaranteed by the caller
        unsafe {
            self.context.driver().memcpy_dtoh_async(
                device,
                data.as_mut_ptr(),
                tensor.data.offset(offset),
                data.len(),
                queue.handle(),
            )
        }
        .map_err(|e| e.on_device(device))
    }

    /// Queues a copy from `src`, in this backend's device, to `dst` in `dst_backend`'s device.
    ///
    /// The copy runs on this backend's queue. Work queued on `dst_backend` afterwards waits for it.
    /// `Ok(false)` when the tensors are not in the backends' devices or the devices can not copy
    /// directly, nothing was queued then.
    pub fn cpy_tensor_async(&self, dst_backend: &Backend, src: &Tensor, dst: &Tensor) -> Result<bool, BackendError> {
        let (Some(BufferKind::Device(s)), Some(BufferKind::Device(d))) = (src.buffer_kind(), dst.buffer_kind()) else {
            return Ok(false);
        };
        if s != self.device() || d != dst_backend.device() {
            return Ok(false);
        }
        let bytes = src.nbytes();
        if bytes != dst.nbytes() {
            return Err(BackendError::new(
                ErrorStatus::InvalidTensor,
                format!("copy from '{}' ({bytes} B) to '{}' ({} B)", src.name, dst.name, dst.nbytes()),
            ));
        }
        let negotiator = CopyNegotiator::new(&self.context);
        if !negotiator.copy_device(s, src.data, d, dst.data, bytes, CopyMode::Async)? {
            return Ok(false);
        }
        if !std::ptr::eq(self, dst_backend) {
            let event = self.context.new_event(s)?;
            event.record(&self.context.queue(s)?)?;
            event.wait(&dst_backend.context.queue(d)?)?;
        }
        verbose!(self.context.config().debug_mem(), "xpu::memory", src = s, dst = d, bytes, "queued cross backend copy");
        Ok(true)
    }

    /// Blocks until all work queued by this backend completed.
    pub fn synchronize(&self) -> Result<(), BackendError> {
        self.context.synchronize(self.device())
    }

    /// Queues all nodes of `graph`. Any failure is fatal.
    pub fn graph_compute(&self, graph: &Graph) -> GraphStatus {
        match self.try_graph_compute(graph) {
            Ok(()) => GraphStatus::Success,
            Err(e) => fatal(&e.on_device(self.device())),
        }
    }

    /// Like [`Backend::graph_compute`], returning the failure instead of aborting.
    pub fn try_graph_compute(&self, graph: &Graph) -> Result<(), BackendError> {
        dispatch::graph_compute(&self.context, graph)
    }

    /// Records the current end of this backend's queue in `event`.
    pub fn event_record(&self, event: &Event) -> Result<(), BackendError> {
        if event.device() != self.device() {
            return Err(BackendError::new(
                ErrorStatus::Event,
                format!("event of device {} recorded on {}", event.device(), self.name),
            ));
        }
        event.record(&self.context.queue(self.device())?)
    }

    /// Work queued on this backend after this call waits for `event`.
    pub fn event_wait(&self, event: &Event) -> Result<(), BackendError> {
        event.wait(&self.context.queue(self.device())?)
    }
}
