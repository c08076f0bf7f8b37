//! Picks how bytes move between two placements.
//!
//! | src \ dst | device a           | device b            | host            |
//! |-----------|--------------------|---------------------|-----------------|
//! | device a  | on a's queue       | peer, on a's queue  | device to host  |
//! | host      | host to device     | host to device      | host memcpy     |
//!
//! Peer copies happen only when enabled, otherwise the negotiator refuses and the caller
//! stages the copy through host memory. Split tensors are never copied here.

use crate::{
    buffer::{check_range, BufferKind},
    context::DeviceContext,
    driver::DevicePtr,
    error::{BackendError, ErrorStatus},
    tensor::Tensor,
    DeviceId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Device(DeviceId),
    Host,
    Split,
}

impl From<BufferKind> for Placement {
    fn from(kind: BufferKind) -> Self {
        match kind {
            BufferKind::Device(d) => Placement::Device(d),
            BufferKind::Host { .. } => Placement::Host,
            BufferKind::Split => Placement::Split,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPath {
    SameDevice(DeviceId),
    PeerToPeer { src: DeviceId, dst: DeviceId },
    HostToDevice(DeviceId),
    DeviceToHost(DeviceId),
    HostToHost,
    /// Caller has to stage or give up
    Refused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Returns once the copy completed
    Sync,
    /// Returns once the copy is queued, the caller synchronizes the queue of the issuing device
    Async,
}

pub fn plan(src: Placement, dst: Placement, peer_copy: bool) -> CopyPath {
    match (src, dst) {
        (Placement::Device(s), Placement::Device(d)) if s == d => CopyPath::SameDevice(s),
        (Placement::Device(s), Placement::Device(d)) if peer_copy => CopyPath::PeerToPeer { src: s, dst: d },
        (Placement::Host, Placement::Device(d)) => CopyPath::HostToDevice(d),
        (Placement::Device(s), Placement::Host) => CopyPath::DeviceToHost(s),
        (Placement::Host, Placement::Host) => CopyPath::HostToHost,
        _ => CopyPath::Refused,
    }
}

/// Issues copies through the queues of one device context.
#[derive(Debug)]
pub struct CopyNegotiator<'a> {
    ctx: &'a DeviceContext,
    peer_copy: bool,
}

impl<'a> CopyNegotiator<'a> {
    pub fn new(ctx: &'a DeviceContext) -> CopyNegotiator<'a> {
        CopyNegotiator { ctx, peer_copy: ctx.config().peer_copy_enabled() }
    }

    pub fn peer_copy(&self) -> bool {
        self.peer_copy
    }

    /// Copies all bytes of `src` into `dst`. `Ok(false)` if no path exists and nothing was copied.
    ///
    /// Copies touching host memory always complete before this returns, only device to device
    /// copies honor [`CopyMode::Async`].
    pub fn copy_tensor(&self, src: &Tensor, dst: &Tensor, mode: CopyMode) -> Result<bool, BackendError> {
        let (Some(src_buffer), Some(dst_buffer)) = (&src.buffer, &dst.buffer) else {
            return Err(BackendError::new(
                ErrorStatus::InvalidTensor,
                format!("copy from '{}' to '{}' with an unallocated tensor", src.name, dst.name),
            ));
        };
        let bytes = src.nbytes();
        if bytes != dst.nbytes() {
            return Err(BackendError::new(
                ErrorStatus::InvalidTensor,
                format!("copy from '{}' ({bytes} B) to '{}' ({} B)", src.name, dst.name, dst.nbytes()),
            ));
        }
        let path = plan(src_buffer.kind().into(), dst_buffer.kind().into(), self.peer_copy);
        if path != CopyPath::Refused {
            check_range(src_buffer.base(), src_buffer.size(), src, 0, bytes)?;
            check_range(dst_buffer.base(), dst_buffer.size(), dst, 0, bytes)?;
        }
        let driver = self.ctx.driver();
        match path {
            CopyPath::SameDevice(_) | CopyPath::PeerToPeer { .. } | CopyPath::Refused => {
                self.issue(path, src.data, dst.data, bytes, mode)
            }
            CopyPath::HostToDevice(d) => {
                let queue = self.ctx.queue(d)?;
                // SAFETY: src range is inside its host buffer, the queue is synchronized below
                unsafe { driver.memcpy_htod_async(d, dst.data, src.data.0 as *const u8, bytes, queue.handle()) }
                    .map_err(|e| e.on_device(d))?;
                self.ctx.synchronize(d)?;
                Ok(true)
            }
            CopyPath::DeviceToHost(d) => {
                let queue = self.ctx.queue(d)?;
                // SAFETY: dst range is inside its host buffer, the queue is synchronized below
                unsafe { driver.memcpy_dtoh_async(d, dst.data.0 as *mut u8, src.data, bytes, queue.handle()) }
                    .map_err(|e| e.on_device(d))?;
                self.ctx.synchronize(d)?;
                Ok(true)
            }
            CopyPath::HostToHost => {
                // SAFETY: both ranges were checked against their host buffers
                unsafe { std::ptr::copy(src.data.0 as *const u8, dst.data.0 as *mut u8, bytes) };
                Ok(true)
            }
        }
    }

    /// Copies between two device addresses. `Ok(false)` if the devices differ and peer copies
    /// are disabled.
    pub fn copy_device(
        &self,
        src_device: DeviceId,
        src: DevicePtr,
        dst_device: DeviceId,
        dst: DevicePtr,
        bytes: usize,
        mode: CopyMode,
    ) -> Result<bool, BackendError> {
        let path = plan(Placement::Device(src_device), Placement::Device(dst_device), self.peer_copy);
        self.issue(path, src, dst, bytes, mode)
    }

    fn issue(
        &self,
        path: CopyPath,
        src: DevicePtr,
        dst: DevicePtr,
        bytes: usize,
        mode: CopyMode,
    ) -> Result<bool, BackendError> {
        let driver = self.ctx.driver();
        let device = match path {
            CopyPath::SameDevice(d) => {
                let queue = self.ctx.queue(d)?;
                driver.memcpy_dtod_async(d, dst, src, bytes, queue.handle()).map_err(|e| e.on_device(d))?;
                d
            }
            CopyPath::PeerToPeer { src: s, dst: d } => {
                let queue = self.ctx.queue(s)?;
                driver.memcpy_peer_async(d, dst, s, src, bytes, queue.handle()).map_err(|e| e.on_device(s))?;
                s
            }
            _ => {
                verbose!(self.ctx.config().debug_mem(), "xpu::memory", ?path, bytes, "copy refused");
                return Ok(false);
            }
        };
        verbose!(self.ctx.config().debug_mem(), "xpu::memory", ?path, bytes, ?mode, "copy issued");
        if mode == CopyMode::Sync {
            self.ctx.synchronize(device)?;
        }
        Ok(true)
    }
}
