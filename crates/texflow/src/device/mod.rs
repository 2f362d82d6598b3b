//! Device integration layer.
//!
//! The backend drives the device only through [`GpgpuDevice`]. Work that
//! completes later (async downloads, fences, timer queries) is started with a
//! `begin`/`insert` call and observed by polling, which [`PollFuture`] turns
//! into a `std::future::Future`.

mod eval;
mod reference;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, BackendResult};
use crate::layout::{PackingKind, TextureShape};
use crate::programs::{KernelSource, ParamBinding};

pub use reference::{DeviceStats, ReferenceDevice};

macro_rules! device_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

device_id!(
    /// Device texture handle.
    TextureId,
    "texture"
);
device_id!(
    /// Compiled program handle.
    ProgramId,
    "program"
);
device_id!(QueryId, "query");
device_id!(FenceId, "fence");
device_id!(TransferId, "transfer");

/// Level of GPU timer-query support. Ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerQueryVersion {
    None,
    V1,
    V2,
}

impl TimerQueryVersion {
    pub fn is_supported(self) -> bool {
        self != TimerQueryVersion::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub max_texture_size: usize,
    pub channels_per_texel: usize,
    /// Non-blocking texture downloads are available.
    pub async_readback: bool,
    pub timer_query: TimerQueryVersion,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            max_texture_size: 4096,
            channels_per_texel: 4,
            async_readback: true,
            timer_query: TimerQueryVersion::V2,
        }
    }
}

/// State of a device operation that completes asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum DevicePoll<T> {
    Pending,
    Ready(T),
    Failed(BackendError),
}

impl<T> DevicePoll<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DevicePoll<U> {
        match self {
            DevicePoll::Pending => DevicePoll::Pending,
            DevicePoll::Ready(value) => DevicePoll::Ready(f(value)),
            DevicePoll::Failed(err) => DevicePoll::Failed(err),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, DevicePoll::Pending)
    }
}

/// Future that repeatedly polls a device operation until it settles.
///
/// The device has no completion callbacks, so a pending poll re-arms the
/// waker immediately.
pub struct PollFuture<F> {
    poll: F,
}

impl<F> PollFuture<F> {
    pub fn new(poll: F) -> Self {
        Self { poll }
    }
}

impl<T, F> Future for PollFuture<F>
where
    F: FnMut() -> DevicePoll<T> + Unpin,
{
    type Output = BackendResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match (self.get_mut().poll)() {
            DevicePoll::Pending => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            DevicePoll::Ready(value) => Poll::Ready(Ok(value)),
            DevicePoll::Failed(err) => Poll::Ready(Err(err)),
        }
    }
}

/// Texture-based GPGPU device.
///
/// Textures hold `channels_per_texel` floats per texel; plain-float uploads
/// and downloads move one value per texel through channel 0, row-major.
pub trait GpgpuDevice: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    fn create_texture(&self, shape: TextureShape, packing: PackingKind) -> BackendResult<TextureId>;
    fn delete_texture(&self, texture: TextureId) -> BackendResult<()>;

    fn upload_matrix(
        &self,
        texture: TextureId,
        shape: TextureShape,
        values: &[f32],
    ) -> BackendResult<()>;
    /// Blocking download of `shape.rows * shape.cols` values.
    fn download_matrix(&self, texture: TextureId, shape: TextureShape) -> BackendResult<Vec<f32>>;
    fn begin_download(&self, texture: TextureId, shape: TextureShape)
        -> BackendResult<TransferId>;
    fn poll_download(&self, transfer: TransferId) -> DevicePoll<Vec<f32>>;

    /// Marks the current end of the command queue.
    fn insert_fence(&self) -> BackendResult<FenceId>;
    fn poll_fence(&self, fence: FenceId) -> DevicePoll<()>;

    fn compile_program(&self, source: &KernelSource) -> BackendResult<ProgramId>;
    fn delete_program(&self, program: ProgramId) -> BackendResult<()>;
    fn run_program(
        &self,
        program: ProgramId,
        inputs: &[TextureId],
        output: TextureId,
        params: &ParamBinding,
    ) -> BackendResult<()>;

    fn begin_query(&self) -> BackendResult<QueryId>;
    fn end_query(&self, query: QueryId) -> BackendResult<()>;
    /// Elapsed milliseconds between `begin_query` and `end_query`.
    fn poll_query(&self, query: QueryId) -> DevicePoll<f64>;
}
