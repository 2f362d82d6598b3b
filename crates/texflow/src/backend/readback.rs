//! Moving tensor contents back to the host.
//!
//! A read either finds host values already cached or downloads the texture.
//! The async path prefers a non-blocking transfer. Without one it downloads
//! synchronously, first waiting on a fence when the device exposes timer
//! queries, since such devices queue work deeply enough for a blocking read
//! to stall the pipeline.

use std::sync::Arc;
use std::time::Instant;

use super::{DataId, GpgpuBackend};
use crate::device::{PollFuture, TextureId};
use crate::dtype::TensorData;
use crate::error::{BackendError, BackendResult};
use crate::layout::TextureShape;
use crate::profiling;

enum ReadSource {
    Host(TensorData),
    Device(TextureId, TextureShape),
}

impl GpgpuBackend {
    /// Blocking read of a tensor's values.
    pub fn read_sync(&mut self, id: DataId) -> BackendResult<TensorData> {
        let _scope = profiling::backend_scope("texflow.read_sync");
        match self.read_source(id)? {
            ReadSource::Host(values) => Ok(values),
            ReadSource::Device(texture, shape) => {
                let packed = self.download_blocking(texture, shape)?;
                self.cache_on_host(id, packed)
            }
        }
    }

    /// Reads a tensor's values without blocking on the device where possible.
    pub async fn read(&mut self, id: DataId) -> BackendResult<TensorData> {
        let (texture, shape) = match self.read_source(id)? {
            ReadSource::Host(values) => return Ok(values),
            ReadSource::Device(texture, shape) => (texture, shape),
        };
        let packed = if self.caps.async_readback {
            let transfer = self.device.begin_download(texture, shape)?;
            let device = Arc::clone(&self.device);
            PollFuture::new(move || device.poll_download(transfer)).await?
        } else if !self.caps.timer_query.is_supported() {
            self.download_blocking(texture, shape)?
        } else {
            let fence = self.device.insert_fence()?;
            let device = Arc::clone(&self.device);
            PollFuture::new(move || device.poll_fence(fence)).await?;
            self.download_blocking(texture, shape)?
        };
        tracing::trace!(%id, %texture, "read back tensor");
        self.cache_on_host(id, packed)
    }

    /// Returns cached host values, or the texture to download from.
    ///
    /// With delayed storage a cached read also hands the device copy back to
    /// the pool.
    fn read_source(&mut self, id: DataId) -> BackendResult<ReadSource> {
        let delayed = self.config.delayed_storage;
        let record = self.table.get_mut(id)?;
        if let Some(values) = record.values.clone() {
            if delayed {
                if let (Some(texture), Some(shape)) =
                    (record.texture.take(), record.texture_shape.take())
                {
                    self.pool.release(texture, shape, record.packing);
                }
            }
            return Ok(ReadSource::Host(values));
        }
        match (record.texture, record.texture_shape) {
            (Some(texture), Some(shape)) => Ok(ReadSource::Device(texture, shape)),
            _ => Err(BackendError::Uninitialized { handle: id }),
        }
    }

    fn download_blocking(
        &mut self,
        texture: TextureId,
        shape: TextureShape,
    ) -> BackendResult<Vec<f32>> {
        let start = self.timers.is_active().then(Instant::now);
        let packed = self.device.download_matrix(texture, shape)?;
        if let Some(start) = start {
            self.timers.add_download_wait(start);
        }
        Ok(packed)
    }

    /// Stores downloaded texels as the record's host values.
    fn cache_on_host(&mut self, id: DataId, mut packed: Vec<f32>) -> BackendResult<TensorData> {
        let delayed = self.config.delayed_storage;
        let record = self.table.get_mut(id)?;
        packed.truncate(record.size());
        let values = TensorData::from_packed(packed, record.dtype);
        record.values = Some(values.clone());
        if delayed {
            if let (Some(texture), Some(shape)) = (record.texture.take(), record.texture_shape.take())
            {
                self.pool.release(texture, shape, record.packing);
            }
        }
        Ok(values)
    }
}
