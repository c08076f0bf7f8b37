//! Compute provider seam.
//!
//! Numeric kernels live in a separate library. The dispatcher only hands it nodes,
//! the provider decides how to run them on the device's queue.

mod reference;

use crate::{
    context::{DeviceContext, Queue},
    driver::DevicePtr,
    error::BackendError,
    graph::Graph,
    tensor::TensorId,
    DType, DeviceId,
};

pub use reference::ReferenceProvider;

/// Opaque per device handle of a compute provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputeHandle(pub u64);

/// One device's share of a matrix multiplication with a row split `src0`.
///
/// `src0` holds `rows` rows of `ne00` elements, `src1` holds `ne11` dense f32 columns of `ne00`
/// elements, both on `device`. The result is written to `dst` as `ne11` columns of `rows` f32
/// values, `dst[c * rows + r]`.
#[derive(Debug, Clone, Copy)]
pub struct RowSliceMatMul {
    pub device: DeviceId,
    pub queue: Queue,
    pub src0: DevicePtr,
    pub src0_type: DType,
    pub ne00: i64,
    pub rows: i64,
    pub src1: DevicePtr,
    pub ne11: i64,
    pub dst: DevicePtr,
}

pub trait ComputeProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn create_handle(&self, device: DeviceId, queue: &Queue) -> Result<ComputeHandle, BackendError>;

    fn destroy_handle(&self, device: DeviceId, handle: ComputeHandle) -> Result<(), BackendError>;

    /// Issues `node` on the queue of the context's main device.
    /// `Ok(false)` means the provider has no kernel for it.
    fn compute(&self, ctx: &DeviceContext, graph: &Graph, node: TensorId) -> Result<bool, BackendError>;

    /// Issues one row slice of a split matrix multiplication on `job.queue`.
    fn mul_mat_rows(&self, ctx: &DeviceContext, job: &RowSliceMatMul) -> Result<bool, BackendError>;
}
