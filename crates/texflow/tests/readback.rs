mod common;

use anyhow::Result;
use futures::executor::block_on;
use texflow::{BackendConfig, BackendError, DType, ReferenceDevice, TensorData, TimerQueryVersion};

use common::{backend_with, f32_tensor, i32_tensor};

fn device() -> ReferenceDevice {
    ReferenceDevice::new().with_poll_latency(3)
}

#[test]
fn async_read_uses_non_blocking_transfer() -> Result<()> {
    let (device, mut backend) = backend_with(device(), BackendConfig::default());
    let x = f32_tensor(&mut backend, &[2, 2], &[1.0, -2.0, 3.0, -4.0])?;
    let y = backend.abs(x)?;
    let values = block_on(backend.read(y))?;
    assert_eq!(values, TensorData::from(vec![1.0f32, 2.0, 3.0, 4.0]));
    let stats = device.stats()?;
    assert_eq!(stats.async_downloads, 1);
    assert_eq!(stats.sync_downloads, 0);
    assert_eq!(stats.fences, 0);
    Ok(())
}

#[test]
fn without_timer_queries_reads_download_directly() -> Result<()> {
    let config = BackendConfig::default()
        .with_async_readback(false)
        .with_timer_query(TimerQueryVersion::None);
    let (device, mut backend) = backend_with(device(), config);
    let x = i32_tensor(&mut backend, &[3], &[5, -6, 7])?;
    let y = backend.neg(x)?;
    assert_eq!(block_on(backend.read(y))?, TensorData::from(vec![-5i32, 6, -7]));
    let stats = device.stats()?;
    assert_eq!(stats.async_downloads, 0);
    assert_eq!(stats.sync_downloads, 1);
    assert_eq!(stats.fences, 0);
    Ok(())
}

#[test]
fn with_timer_queries_reads_wait_on_a_fence_first() -> Result<()> {
    let config = BackendConfig::default().with_async_readback(false);
    let (device, mut backend) = backend_with(device(), config);
    let x = f32_tensor(&mut backend, &[2], &[0.25, 4.0])?;
    let y = backend.sqrt(x)?;
    assert_eq!(block_on(backend.read(y))?, TensorData::from(vec![0.5f32, 2.0]));
    let stats = device.stats()?;
    assert_eq!(stats.fences, 1);
    assert_eq!(stats.sync_downloads, 1);
    assert_eq!(stats.async_downloads, 0);
    Ok(())
}

#[test]
fn host_cached_reads_skip_the_device() -> Result<()> {
    let (device, mut backend) = backend_with(device(), BackendConfig::default());
    let x = f32_tensor(&mut backend, &[2], &[1.0, 2.0])?;
    assert_eq!(block_on(backend.read(x))?, TensorData::from(vec![1.0f32, 2.0]));
    let y = backend.exp(x)?;
    block_on(backend.read(y))?;
    block_on(backend.read(y))?;
    let stats = device.stats()?;
    assert_eq!(stats.async_downloads + stats.sync_downloads, 1);
    Ok(())
}

#[test]
fn immediate_storage_keeps_the_texture_after_reading() -> Result<()> {
    let config = BackendConfig::default().with_delayed_storage(false);
    let (_device, mut backend) = backend_with(device(), config);
    let x = f32_tensor(&mut backend, &[2], &[1.0, 2.0])?;
    let y = backend.add(x, x)?;
    block_on(backend.read(y))?;
    let record = backend.record(y)?;
    assert!(record.texture.is_some());
    assert_eq!(record.values, Some(TensorData::from(vec![2.0f32, 4.0])));
    Ok(())
}

#[test]
fn reading_unwritten_tensors_fails() -> Result<()> {
    let (_device, mut backend) = backend_with(device(), BackendConfig::default());
    let x = backend.make_tensor(&[2], DType::F32)?;
    assert_eq!(
        block_on(backend.read(x)),
        Err(BackendError::Uninitialized { handle: x })
    );
    Ok(())
}

#[test]
fn config_cannot_enable_missing_capabilities() -> Result<()> {
    let config = BackendConfig::default().with_async_readback(true);
    let (device, mut backend) = backend_with(device().with_async_readback(false), config);
    assert!(!backend.capabilities().async_readback);
    let x = f32_tensor(&mut backend, &[1], &[3.0])?;
    let y = backend.square(x)?;
    assert_eq!(block_on(backend.read(y))?, TensorData::from(vec![9.0f32]));
    assert_eq!(device.stats()?.async_downloads, 0);
    Ok(())
}
