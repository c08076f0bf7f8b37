//! Multi device accelerator backend for tensor graph runtimes.
//!
//! The host runtime builds a [`Graph`], asks each [`DeviceDesc`] which nodes it supports,
//! allocates tensors from device, split or host buffer types and hands the node list to a
//! [`Backend`]. Numeric kernels come from a [`ComputeProvider`], devices from a [`Driver`].
//!
//! ```no_run
//! use xpu::{registry, BufferType, DType, Graph, TensorAllocator, XpuError};
//!
//! fn main() -> Result<(), XpuError> {
//!     let device = registry().device(0)?;
//!     let backend = device.init_backend()?;
//!     let mut graph = Graph::new();
//!     let x = graph.tensor(DType::F32, &[4]);
//!     let y = graph.unary(x, xpu::UnaryOp::Relu);
//!     graph.build_forward(y);
//!     let buffer = std::sync::Arc::new(device.buffer_type().alloc_buffer(1024)?);
//!     let mut alloc = TensorAllocator::new(buffer);
//!     alloc.alloc(&mut graph, x)?;
//!     alloc.alloc(&mut graph, y)?;
//!     backend.graph_compute(&graph);
//!     backend.synchronize()?;
//!     Ok(())
//! }
//! ```

#![forbid(rustdoc::broken_intra_doc_links)]
#![forbid(rustdoc::invalid_codeblock_attributes)]
#![forbid(rustdoc::invalid_rust_codeblocks)]

/// Logs at info when the category's debug bit is set, at trace otherwise.
macro_rules! verbose {
    ($enabled:expr, $target:literal, $($arg:tt)+) => {
        if $enabled {
            tracing::info!(target: $target, $($arg)+)
        } else {
            tracing::trace!(target: $target, $($arg)+)
        }
    };
}

mod backend;
pub mod buffer;
mod config;
mod context;
pub mod copy;
mod dispatch;
pub mod driver;
mod dtype;
mod error;
mod graph;
mod mutex;
mod pool;
pub mod provider;
mod registry;
pub mod split;
pub mod supports;
mod tensor;

pub use backend::{Backend, GraphStatus};
pub use buffer::{Buffer, BufferKind, BufferType, BufferUsage, TensorAllocator};
pub use config::{BackendConfig, CONFIG_FILE, DEBUG_DEV, DEBUG_DISPATCH, DEBUG_MEM};
pub use context::{DeviceContext, Event, Queue};
pub use driver::{DevicePtr, Driver};
pub use dtype::DType;
pub use error::{fatal, BackendError, ErrorStatus, XpuError};
pub use graph::Graph;
pub use pool::{MemoryPool, PoolAlloc};
pub use provider::{ComputeProvider, ReferenceProvider};
pub use registry::{registry, DeviceCaps, DeviceDesc, DeviceType, Registry};
pub use tensor::{Op, Tensor, TensorId, UnaryOp};

/// Index of a physical device
pub type DeviceId = usize;

pub const MAX_DEVICES: usize = 16;
pub const MAX_DIMS: usize = 4;
pub const MAX_SRC: usize = 10;
/// In i32 words
pub const MAX_OP_PARAMS: usize = 16;
pub const TENSOR_ALIGNMENT: usize = 128;
/// Kernels read rows in chunks of this many elements
pub const MATRIX_ROW_PADDING: i64 = 512;
pub const DEFAULT_ROW_ROUNDING: i64 = 32;
pub const DEFAULT_OFFLOAD_MIN_BATCH: i64 = 32;
