//! Texture-backed tensor backend.
//!
//! [`GpgpuBackend`] owns the resource table, the texture pool and the kernel
//! cache. Every state-changing call takes `&mut self`; the device itself is
//! shared behind an `Arc`.

mod dispatch;
mod kernel_cache;
mod ops;
mod pool;
mod readback;
mod reduce;
mod table;
mod timing;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::config::BackendConfig;
use crate::device::{DeviceCapabilities, GpgpuDevice};
use crate::dtype::{DType, TensorData};
use crate::error::{BackendError, BackendResult};
use crate::layout::PackingKind;
use crate::profiling;

pub use kernel_cache::{CompiledKernel, KernelCacheStats};
pub use table::{DataId, StorageRecord};
pub use timing::{TimingFuture, TimingInfo};

use kernel_cache::KernelCache;
use pool::TexturePool;
use table::ResourceTable;
use timing::TimerStack;

/// Texture accounting reported by [`GpgpuBackend::memory`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryInfo {
    /// Always `false`: every texture is tracked by the pool.
    pub unreliable: bool,
    pub allocated_textures: usize,
    pub used_textures: usize,
    pub free_textures: usize,
}

pub struct GpgpuBackend {
    device: Arc<dyn GpgpuDevice>,
    config: BackendConfig,
    caps: DeviceCapabilities,
    table: ResourceTable,
    pool: TexturePool,
    kernels: KernelCache,
    timers: TimerStack,
    epoch: Arc<AtomicU32>,
}

impl GpgpuBackend {
    pub fn new(device: Arc<dyn GpgpuDevice>) -> Self {
        Self::with_config(device, BackendConfig::default())
    }

    pub fn with_config(device: Arc<dyn GpgpuDevice>, config: BackendConfig) -> Self {
        let caps = config.effective_capabilities(device.capabilities());
        tracing::debug!(
            max_texture_size = caps.max_texture_size,
            async_readback = caps.async_readback,
            timer_query = ?caps.timer_query,
            delayed_storage = config.delayed_storage,
            "texture backend ready"
        );
        Self {
            device,
            config,
            caps,
            table: ResourceTable::new(),
            pool: TexturePool::new(),
            kernels: KernelCache::new(),
            timers: TimerStack::default(),
            epoch: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Device capabilities after config overrides.
    pub fn capabilities(&self) -> DeviceCapabilities {
        self.caps
    }

    pub fn device(&self) -> &Arc<dyn GpgpuDevice> {
        &self.device
    }

    pub fn kernel_cache_stats(&self) -> KernelCacheStats {
        self.kernels.stats()
    }

    /// Number of textures handed out again from the pool instead of created.
    pub fn textures_reused(&self) -> u64 {
        self.pool.reused()
    }

    /// Reserves a fresh handle; it becomes usable once registered.
    pub fn new_data_id(&mut self) -> DataId {
        self.table.new_id()
    }

    pub fn register(&mut self, id: DataId, shape: &[usize], dtype: DType) -> BackendResult<()> {
        self.table.register(id, shape, dtype)
    }

    /// Reserves and registers an empty tensor.
    pub fn make_tensor(&mut self, shape: &[usize], dtype: DType) -> BackendResult<DataId> {
        let id = self.new_data_id();
        self.register(id, shape, dtype)?;
        Ok(id)
    }

    pub fn make_tensor_with(&mut self, shape: &[usize], data: TensorData) -> BackendResult<DataId> {
        let id = self.make_tensor(shape, data.dtype())?;
        if let Err(err) = self.write(id, Some(data)) {
            self.discard(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Registers decoded 8-bit pixel data as an `i32` `[height, width,
    /// channels]` tensor stored in a byte-packed texture.
    ///
    /// Decoding images or canvases into bytes is left to the caller.
    pub fn from_pixels(&mut self, shape: [usize; 3], pixels: &[u8]) -> BackendResult<DataId> {
        if !(1..=4).contains(&shape[2]) {
            return Err(BackendError::invalid(
                "from_pixels",
                format!("pixel data needs 1 to 4 channels, got {}", shape[2]),
            ));
        }
        let id = self.make_tensor(&shape, DType::I32)?;
        self.table.get_mut(id)?.packing = PackingKind::PixelByte;
        let values: Vec<i32> = pixels.iter().map(|&p| i32::from(p)).collect();
        if let Err(err) = self.write(id, Some(TensorData::from(values))) {
            self.discard(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Drops a half-built record on an error path.
    fn discard(&mut self, id: DataId) {
        if let Err(err) = self.dispose_data(id) {
            tracing::warn!(%id, error = %err, "failed to roll back tensor registration");
        }
    }

    pub fn num_data_ids(&self) -> usize {
        self.table.len()
    }

    pub fn shape(&self, id: DataId) -> BackendResult<Vec<usize>> {
        Ok(self.table.get(id)?.shape.clone())
    }

    pub fn dtype(&self, id: DataId) -> BackendResult<DType> {
        Ok(self.table.get(id)?.dtype)
    }

    /// Snapshot of a record, for inspection.
    pub fn record(&self, id: DataId) -> BackendResult<StorageRecord> {
        self.table.get(id).cloned()
    }

    /// Replaces a tensor's contents with host values.
    ///
    /// Any device copy is returned to the pool. Without delayed storage the
    /// values are uploaded immediately.
    pub fn write(&mut self, id: DataId, values: Option<TensorData>) -> BackendResult<()> {
        let Some(values) = values else {
            return Err(BackendError::NullInput { handle: id });
        };
        let record = self.table.get_mut(id)?;
        if values.dtype() != record.dtype {
            return Err(BackendError::DTypeMismatch {
                handle: id,
                expected: record.dtype,
                found: values.dtype(),
            });
        }
        if values.len() != record.size() {
            return Err(BackendError::ShapeMismatch {
                context: format!("write to {id} with shape {:?}", record.shape),
                expected: record.size(),
                found: values.len(),
            });
        }
        if let (Some(texture), Some(shape)) = (record.texture.take(), record.texture_shape.take()) {
            self.pool.release(texture, shape, record.packing);
        }
        record.values = Some(values);
        if !self.config.delayed_storage {
            self.upload_to_device(id)?;
        }
        Ok(())
    }

    pub fn dispose_data(&mut self, id: DataId) -> BackendResult<()> {
        let record = self.table.remove(id)?;
        if let (Some(texture), Some(shape)) = (record.texture, record.texture_shape) {
            self.pool.release(texture, shape, record.packing);
        }
        Ok(())
    }

    pub fn memory(&self) -> MemoryInfo {
        MemoryInfo {
            unreliable: false,
            allocated_textures: self.pool.allocated(),
            used_textures: self.pool.used(),
            free_textures: self.pool.free(),
        }
    }

    /// Runs `region` inside a timer scope.
    ///
    /// The returned future resolves once every kernel timed in the region
    /// (including nested `time` calls) reports its duration. Upload and
    /// download waits accumulated since the previous `time` call are captured
    /// and reset.
    pub fn time<F>(&mut self, region: F) -> BackendResult<TimingFuture>
    where
        F: FnOnce(&mut Self) -> BackendResult<()>,
    {
        let epoch = self.table.epoch();
        let start = Instant::now();
        self.timers.push_scope();
        let outcome = region(self);
        let timers = if self.table.epoch() == epoch {
            self.timers.pop_scope()
        } else {
            Vec::new()
        };
        let wall_ms = start.elapsed().as_secs_f64() * 1000.0;
        let (upload_wait_ms, download_wait_ms) = self.timers.take_waits();
        outcome?;
        Ok(TimingFuture::new(
            Arc::clone(&self.device),
            Arc::clone(&self.epoch),
            epoch,
            timers,
            TimingInfo {
                kernel_ms: 0.0,
                upload_wait_ms,
                download_wait_ms,
                wall_ms,
            },
        ))
    }

    /// Frees every texture and compiled program and invalidates all handles.
    ///
    /// The backend stays usable: new handles and kernels are created on
    /// demand afterwards.
    pub fn dispose(&mut self) -> BackendResult<()> {
        let _scope = profiling::backend_scope("texflow.dispose");
        let records = self.table.clear();
        let released = records.len();
        for record in records {
            if let (Some(texture), Some(shape)) = (record.texture, record.texture_shape) {
                self.pool.release(texture, shape, record.packing);
            }
        }
        self.timers.reset();
        self.epoch.store(self.table.epoch(), Ordering::Release);
        let programs = self.kernels.stats().entries;
        let textures = self.pool.allocated();
        let pool_result = self.pool.dispose(self.device.as_ref());
        let kernel_result = self.kernels.dispose(self.device.as_ref());
        tracing::debug!(released, textures, programs, "disposed texture backend");
        pool_result.and(kernel_result)
    }
}
