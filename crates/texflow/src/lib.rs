//! Tensor execution on texture-based GPGPU devices.
//!
//! Tensors live in a generation-checked resource table and move between host
//! buffers and pooled device textures on demand. Ops compile to kernels that
//! are cached by structural signature; results are read back synchronously or
//! through polled futures.

pub mod backend;
pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod profiling;
pub mod programs;

pub use backend::{DataId, GpgpuBackend, MemoryInfo, TimingFuture, TimingInfo};
pub use config::BackendConfig;
pub use device::{DeviceCapabilities, GpgpuDevice, ReferenceDevice, TimerQueryVersion};
pub use dtype::{DType, TensorData};
pub use error::{BackendError, BackendResult};
pub use programs::{ConvParams, Padding};
