use std::collections::HashMap;

use crate::device::{GpgpuDevice, TextureId};
use crate::error::BackendResult;
use crate::layout::{PackingKind, TextureShape};
use crate::profiling;

/// Device textures keyed by physical layout, recycled instead of deleted.
///
/// Released textures are kept on a per-key LIFO stack. The caller must not
/// release a texture that a live record still points at.
#[derive(Default)]
pub(crate) struct TexturePool {
    free: HashMap<(TextureShape, PackingKind), Vec<TextureId>>,
    allocated: usize,
    used: usize,
    reused: u64,
}

impl TexturePool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn acquire(
        &mut self,
        device: &dyn GpgpuDevice,
        shape: TextureShape,
        packing: PackingKind,
    ) -> BackendResult<TextureId> {
        if let Some(texture) = self
            .free
            .get_mut(&(shape, packing))
            .and_then(|stack| stack.pop())
        {
            profiling::cache_event("texflow.texture_reuse");
            self.used += 1;
            self.reused += 1;
            return Ok(texture);
        }
        profiling::cache_event("texflow.texture_alloc");
        let texture = device.create_texture(shape, packing)?;
        tracing::debug!(
            %texture,
            rows = shape.rows,
            cols = shape.cols,
            ?packing,
            "allocated texture"
        );
        self.allocated += 1;
        self.used += 1;
        Ok(texture)
    }

    pub(crate) fn release(
        &mut self,
        texture: TextureId,
        shape: TextureShape,
        packing: PackingKind,
    ) {
        self.free.entry((shape, packing)).or_default().push(texture);
        self.used = self.used.saturating_sub(1);
    }

    pub(crate) fn allocated(&self) -> usize {
        self.allocated
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }

    pub(crate) fn free(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    pub(crate) fn reused(&self) -> u64 {
        self.reused
    }

    /// Deletes every free texture on the device and resets the counters.
    ///
    /// Every texture still in use must be released first or it leaks.
    pub(crate) fn dispose(&mut self, device: &dyn GpgpuDevice) -> BackendResult<()> {
        let mut first_err = None;
        for (_, stack) in self.free.drain() {
            for texture in stack {
                if let Err(err) = device.delete_texture(texture) {
                    first_err.get_or_insert(err);
                }
            }
        }
        self.allocated = 0;
        self.used = 0;
        self.reused = 0;
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ReferenceDevice;

    #[test]
    fn released_textures_are_reused_per_key() {
        let device = ReferenceDevice::new();
        let mut pool = TexturePool::new();
        let shape = TextureShape::new(2, 3);
        let first = pool.acquire(&device, shape, PackingKind::Float).unwrap();
        pool.release(first, shape, PackingKind::Float);
        let other_kind = pool.acquire(&device, shape, PackingKind::PixelByte).unwrap();
        assert_ne!(other_kind, first);
        let again = pool.acquire(&device, shape, PackingKind::Float).unwrap();
        assert_eq!(again, first);
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.used(), 2);
        assert_eq!(pool.free(), 0);
    }

    #[test]
    fn dispose_deletes_free_textures() {
        let device = ReferenceDevice::new();
        let mut pool = TexturePool::new();
        let shape = TextureShape::new(1, 1);
        let texture = pool.acquire(&device, shape, PackingKind::Float).unwrap();
        pool.release(texture, shape, PackingKind::Float);
        pool.dispose(&device).unwrap();
        let stats = device.stats().unwrap();
        assert_eq!(stats.live_textures, 0);
        assert_eq!(pool.allocated(), 0);
    }
}
