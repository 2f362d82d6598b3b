#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{anyhow, Result};
use texflow::{BackendConfig, DataId, GpgpuBackend, GpgpuDevice, ReferenceDevice, TensorData};

pub fn backend() -> (Arc<ReferenceDevice>, GpgpuBackend) {
    backend_with(ReferenceDevice::new(), BackendConfig::default())
}

pub fn backend_with(
    device: ReferenceDevice,
    config: BackendConfig,
) -> (Arc<ReferenceDevice>, GpgpuBackend) {
    let device = Arc::new(device);
    let shared: Arc<dyn GpgpuDevice> = device.clone();
    (device, GpgpuBackend::with_config(shared, config))
}

pub fn f32_tensor(backend: &mut GpgpuBackend, shape: &[usize], values: &[f32]) -> Result<DataId> {
    Ok(backend.make_tensor_with(shape, TensorData::from(values.to_vec()))?)
}

pub fn i32_tensor(backend: &mut GpgpuBackend, shape: &[usize], values: &[i32]) -> Result<DataId> {
    Ok(backend.make_tensor_with(shape, TensorData::from(values.to_vec()))?)
}

pub fn bool_tensor(backend: &mut GpgpuBackend, shape: &[usize], values: &[bool]) -> Result<DataId> {
    Ok(backend.make_tensor_with(shape, TensorData::from(values.to_vec()))?)
}

pub fn read_f32(backend: &mut GpgpuBackend, id: DataId) -> Result<Vec<f32>> {
    match backend.read_sync(id)? {
        TensorData::F32(values) => Ok(values),
        other => Err(anyhow!("expected f32 data, got {:?}", other.dtype())),
    }
}

pub fn read_i32(backend: &mut GpgpuBackend, id: DataId) -> Result<Vec<i32>> {
    match backend.read_sync(id)? {
        TensorData::I32(values) => Ok(values),
        other => Err(anyhow!("expected i32 data, got {:?}", other.dtype())),
    }
}

pub fn read_bool(backend: &mut GpgpuBackend, id: DataId) -> Result<Vec<bool>> {
    match backend.read_sync(id)? {
        TensorData::Bool(values) => Ok(values.into_iter().map(|v| v != 0).collect()),
        other => Err(anyhow!("expected bool data, got {:?}", other.dtype())),
    }
}

pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch: {actual:?} vs {expected:?}");
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "index {index}: got {a}, expected {e} (tolerance {tolerance})"
        );
    }
}
