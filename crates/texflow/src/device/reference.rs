use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::error::{BackendError, BackendResult};
use crate::layout::{size_from_shape, PackingKind, TextureShape};
use crate::programs::{KernelSource, ParamBinding};

use super::eval::execute_kernel;
use super::{
    DeviceCapabilities, DevicePoll, FenceId, GpgpuDevice, ProgramId, QueryId, TextureId,
    TimerQueryVersion, TransferId,
};

/// Running totals of device activity, for tests and diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub textures_created: u64,
    pub textures_deleted: u64,
    pub live_textures: usize,
    pub programs_compiled: u64,
    pub programs_deleted: u64,
    pub live_programs: usize,
    pub program_runs: u64,
    pub uploads: u64,
    pub sync_downloads: u64,
    pub async_downloads: u64,
    pub fences: u64,
    pub queries: u64,
}

struct Texture {
    shape: TextureShape,
    packing: PackingKind,
    texels: Vec<f32>,
}

struct Countdown<T> {
    remaining: usize,
    value: T,
}

struct QueryState {
    start: Instant,
    elapsed_ms: Option<f64>,
    remaining: usize,
}

#[derive(Default)]
struct DeviceState {
    next_id: u64,
    textures: HashMap<TextureId, Texture>,
    programs: HashMap<ProgramId, KernelSource>,
    transfers: HashMap<TransferId, Countdown<Vec<f32>>>,
    fences: HashMap<FenceId, Countdown<()>>,
    queries: HashMap<QueryId, QueryState>,
    active_query: Option<QueryId>,
    stats: DeviceStats,
}

impl DeviceState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn texture(&self, id: TextureId) -> BackendResult<&Texture> {
        self.textures
            .get(&id)
            .ok_or_else(|| BackendError::device(format!("{id} does not exist")))
    }

    fn read_channel0(
        &self,
        id: TextureId,
        shape: TextureShape,
        channels: usize,
    ) -> BackendResult<Vec<f32>> {
        let texture = self.texture(id)?;
        if texture.shape != shape {
            return Err(BackendError::device(format!(
                "{id} is {:?}, read requested {shape:?}",
                texture.shape
            )));
        }
        Ok(texture.texels.iter().step_by(channels).copied().collect())
    }
}

/// In-process device that interprets kernels over host-resident texel arrays.
///
/// Asynchronous work (downloads, fences, timer queries) reports
/// [`DevicePoll::Pending`] for `poll_latency` polls before settling.
pub struct ReferenceDevice {
    caps: DeviceCapabilities,
    poll_latency: usize,
    state: Mutex<DeviceState>,
}

impl Default for ReferenceDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceDevice {
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities::default())
    }

    pub fn with_capabilities(caps: DeviceCapabilities) -> Self {
        Self {
            caps,
            poll_latency: 0,
            state: Mutex::new(DeviceState::default()),
        }
    }

    pub fn with_async_readback(mut self, enabled: bool) -> Self {
        self.caps.async_readback = enabled;
        self
    }

    pub fn with_timer_query(mut self, version: TimerQueryVersion) -> Self {
        self.caps.timer_query = version;
        self
    }

    pub fn with_max_texture_size(mut self, size: usize) -> Self {
        self.caps.max_texture_size = size;
        self
    }

    pub fn with_poll_latency(mut self, polls: usize) -> Self {
        self.poll_latency = polls;
        self
    }

    pub fn stats(&self) -> BackendResult<DeviceStats> {
        Ok(self.lock()?.stats)
    }

    fn lock(&self) -> BackendResult<MutexGuard<'_, DeviceState>> {
        self.state
            .lock()
            .map_err(|_| BackendError::device("reference device state mutex poisoned"))
    }

    fn poll_countdown<T, K>(
        &self,
        key: K,
        select: impl FnOnce(&mut DeviceState) -> &mut HashMap<K, Countdown<T>>,
        label: &str,
    ) -> DevicePoll<T>
    where
        K: std::hash::Hash + Eq + std::fmt::Display + Copy,
    {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(err) => return DevicePoll::Failed(err),
        };
        let pending = select(&mut *state);
        let Some(entry) = pending.get_mut(&key) else {
            return DevicePoll::Failed(BackendError::device(format!("unknown {label} {key}")));
        };
        if entry.remaining > 0 {
            entry.remaining -= 1;
            return DevicePoll::Pending;
        }
        match pending.remove(&key) {
            Some(done) => DevicePoll::Ready(done.value),
            None => DevicePoll::Failed(BackendError::device(format!("unknown {label} {key}"))),
        }
    }
}

impl GpgpuDevice for ReferenceDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.caps
    }

    fn create_texture(
        &self,
        shape: TextureShape,
        packing: PackingKind,
    ) -> BackendResult<TextureId> {
        let max = self.caps.max_texture_size;
        if shape.rows == 0 || shape.cols == 0 || shape.rows > max || shape.cols > max {
            return Err(BackendError::device(format!(
                "texture {shape:?} outside 1..={max} in some dimension"
            )));
        }
        let mut state = self.lock()?;
        let id = TextureId(state.next_id());
        state.textures.insert(
            id,
            Texture {
                shape,
                packing,
                texels: vec![0.0; shape.texel_count() * self.caps.channels_per_texel],
            },
        );
        state.stats.textures_created += 1;
        state.stats.live_textures += 1;
        Ok(id)
    }

    fn delete_texture(&self, texture: TextureId) -> BackendResult<()> {
        let mut state = self.lock()?;
        if state.textures.remove(&texture).is_none() {
            return Err(BackendError::device(format!("{texture} deleted twice")));
        }
        state.stats.textures_deleted += 1;
        state.stats.live_textures -= 1;
        Ok(())
    }

    fn upload_matrix(
        &self,
        texture: TextureId,
        shape: TextureShape,
        values: &[f32],
    ) -> BackendResult<()> {
        let channels = self.caps.channels_per_texel;
        let mut state = self.lock()?;
        let target = state
            .textures
            .get_mut(&texture)
            .ok_or_else(|| BackendError::device(format!("{texture} does not exist")))?;
        if target.shape != shape || values.len() > shape.texel_count() {
            return Err(BackendError::device(format!(
                "upload of {} values as {shape:?} into {texture} of {:?}",
                values.len(),
                target.shape
            )));
        }
        target.texels.fill(0.0);
        let quantize = target.packing == PackingKind::PixelByte;
        for (texel, &value) in target.texels.chunks_mut(channels).zip(values) {
            texel[0] = if quantize {
                value.round().clamp(0.0, 255.0)
            } else {
                value
            };
        }
        state.stats.uploads += 1;
        Ok(())
    }

    fn download_matrix(&self, texture: TextureId, shape: TextureShape) -> BackendResult<Vec<f32>> {
        let mut state = self.lock()?;
        let values = state.read_channel0(texture, shape, self.caps.channels_per_texel)?;
        state.stats.sync_downloads += 1;
        Ok(values)
    }

    fn begin_download(&self, texture: TextureId, shape: TextureShape) -> BackendResult<TransferId> {
        if !self.caps.async_readback {
            return Err(BackendError::device("async readback is not supported"));
        }
        let mut state = self.lock()?;
        let value = state.read_channel0(texture, shape, self.caps.channels_per_texel)?;
        let id = TransferId(state.next_id());
        state.transfers.insert(
            id,
            Countdown {
                remaining: self.poll_latency,
                value,
            },
        );
        state.stats.async_downloads += 1;
        Ok(id)
    }

    fn poll_download(&self, transfer: TransferId) -> DevicePoll<Vec<f32>> {
        self.poll_countdown(transfer, |state| &mut state.transfers, "transfer")
    }

    fn insert_fence(&self) -> BackendResult<FenceId> {
        let mut state = self.lock()?;
        let id = FenceId(state.next_id());
        state.fences.insert(
            id,
            Countdown {
                remaining: self.poll_latency,
                value: (),
            },
        );
        state.stats.fences += 1;
        Ok(id)
    }

    fn poll_fence(&self, fence: FenceId) -> DevicePoll<()> {
        self.poll_countdown(fence, |state| &mut state.fences, "fence")
    }

    fn compile_program(&self, source: &KernelSource) -> BackendResult<ProgramId> {
        let signature = &source.signature;
        if let Some(arity) = signature.op.arity() {
            if arity != signature.inputs.len() {
                return Err(BackendError::device(format!(
                    "{} kernel binds {arity} inputs, signature has {}",
                    signature.op.name(),
                    signature.inputs.len()
                )));
            }
        }
        for operand in signature.inputs.iter().chain(Some(&signature.output)) {
            if size_from_shape(&operand.shape) > operand.texture_shape.texel_count() {
                return Err(BackendError::device(format!(
                    "operand {:?} does not fit texture {:?}",
                    operand.shape, operand.texture_shape
                )));
            }
        }
        let mut state = self.lock()?;
        let id = ProgramId(state.next_id());
        state.programs.insert(id, source.clone());
        state.stats.programs_compiled += 1;
        state.stats.live_programs += 1;
        Ok(id)
    }

    fn delete_program(&self, program: ProgramId) -> BackendResult<()> {
        let mut state = self.lock()?;
        if state.programs.remove(&program).is_none() {
            return Err(BackendError::device(format!("{program} deleted twice")));
        }
        state.stats.programs_deleted += 1;
        state.stats.live_programs -= 1;
        Ok(())
    }

    fn run_program(
        &self,
        program: ProgramId,
        inputs: &[TextureId],
        output: TextureId,
        params: &ParamBinding,
    ) -> BackendResult<()> {
        let channels = self.caps.channels_per_texel;
        let mut state = self.lock()?;
        let source = state
            .programs
            .get(&program)
            .cloned()
            .ok_or_else(|| BackendError::device(format!("{program} does not exist")))?;
        source.params.check(params)?;
        let signature = &source.signature;
        if inputs.len() != signature.inputs.len() {
            return Err(BackendError::device(format!(
                "{program} expects {} inputs, got {}",
                signature.inputs.len(),
                inputs.len()
            )));
        }
        let mut operands = Vec::with_capacity(inputs.len());
        for (texture, layout) in inputs.iter().zip(&signature.inputs) {
            let mut values = state.read_channel0(*texture, layout.texture_shape, channels)?;
            values.truncate(size_from_shape(&layout.shape));
            operands.push(values);
        }
        let result = execute_kernel(signature, &operands, params)?;
        let target = state
            .textures
            .get_mut(&output)
            .ok_or_else(|| BackendError::device(format!("{output} does not exist")))?;
        if target.shape != signature.output.texture_shape {
            return Err(BackendError::device(format!(
                "output {output} is {:?}, program writes {:?}",
                target.shape, signature.output.texture_shape
            )));
        }
        target.texels.fill(0.0);
        for (texel, value) in target.texels.chunks_mut(channels).zip(result) {
            texel[0] = value;
        }
        state.stats.program_runs += 1;
        Ok(())
    }

    fn begin_query(&self) -> BackendResult<QueryId> {
        if !self.caps.timer_query.is_supported() {
            return Err(BackendError::device("timer queries are not supported"));
        }
        let mut state = self.lock()?;
        if let Some(active) = state.active_query {
            return Err(BackendError::device(format!("{active} is still open")));
        }
        let id = QueryId(state.next_id());
        state.queries.insert(
            id,
            QueryState {
                start: Instant::now(),
                elapsed_ms: None,
                remaining: self.poll_latency,
            },
        );
        state.active_query = Some(id);
        state.stats.queries += 1;
        Ok(id)
    }

    fn end_query(&self, query: QueryId) -> BackendResult<()> {
        let mut state = self.lock()?;
        if state.active_query != Some(query) {
            return Err(BackendError::device(format!("{query} is not the open query")));
        }
        state.active_query = None;
        let entry = state
            .queries
            .get_mut(&query)
            .ok_or_else(|| BackendError::device(format!("unknown query {query}")))?;
        entry.elapsed_ms = Some(entry.start.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    fn poll_query(&self, query: QueryId) -> DevicePoll<f64> {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(err) => return DevicePoll::Failed(err),
        };
        let Some(entry) = state.queries.get_mut(&query) else {
            return DevicePoll::Failed(BackendError::device(format!("unknown query {query}")));
        };
        let Some(elapsed) = entry.elapsed_ms else {
            return DevicePoll::Pending;
        };
        if entry.remaining > 0 {
            entry.remaining -= 1;
            return DevicePoll::Pending;
        }
        state.queries.remove(&query);
        DevicePoll::Ready(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_then_download_uses_channel_zero() {
        let device = ReferenceDevice::new();
        let shape = TextureShape::new(2, 2);
        let texture = device.create_texture(shape, PackingKind::Float).unwrap();
        device
            .upload_matrix(texture, shape, &[1.0, 2.0, 3.0])
            .unwrap();
        assert_eq!(
            device.download_matrix(texture, shape).unwrap(),
            vec![1.0, 2.0, 3.0, 0.0]
        );
    }

    #[test]
    fn fences_settle_after_latency() {
        let device = ReferenceDevice::new().with_poll_latency(2);
        let fence = device.insert_fence().unwrap();
        assert!(device.poll_fence(fence).is_pending());
        assert!(device.poll_fence(fence).is_pending());
        assert_eq!(device.poll_fence(fence), DevicePoll::Ready(()));
        assert!(matches!(device.poll_fence(fence), DevicePoll::Failed(_)));
    }

    #[test]
    fn pixel_textures_quantize() {
        let device = ReferenceDevice::new();
        let shape = TextureShape::new(1, 2);
        let texture = device.create_texture(shape, PackingKind::PixelByte).unwrap();
        device.upload_matrix(texture, shape, &[300.0, 1.6]).unwrap();
        assert_eq!(device.download_matrix(texture, shape).unwrap(), vec![255.0, 2.0]);
    }
}
