mod common;

use anyhow::Result;
use futures::executor::block_on;
use texflow::{BackendConfig, BackendError, ReferenceDevice, TimerQueryVersion};

use common::{backend_with, f32_tensor, read_f32};

fn device() -> ReferenceDevice {
    ReferenceDevice::new().with_poll_latency(2)
}

#[test]
fn nested_regions_report_to_their_parents() -> Result<()> {
    let (device, mut backend) = backend_with(device(), BackendConfig::default());
    let x = f32_tensor(&mut backend, &[4], &[1.0, 2.0, 3.0, 4.0])?;

    let mut inner_kernels = 0;
    let outer = backend.time(|b| {
        let y = b.add(x, x)?;
        let inner = b.time(|b| {
            b.neg(y)?;
            Ok(())
        })?;
        inner_kernels = inner.kernel_count();
        let info = inner.wait()?;
        assert!(info.kernel_ms >= 0.0);
        Ok(())
    })?;

    assert_eq!(inner_kernels, 1);
    assert_eq!(outer.kernel_count(), 2);
    let info = outer.wait()?;
    assert!(info.kernel_ms >= 0.0);
    assert!(info.wall_ms >= 0.0);
    assert_eq!(device.stats()?.queries, 2);
    Ok(())
}

#[test]
fn host_clock_is_used_without_timer_queries() -> Result<()> {
    let config = BackendConfig::default().with_timer_query(TimerQueryVersion::None);
    let (device, mut backend) = backend_with(device(), config);
    let x = f32_tensor(&mut backend, &[2], &[1.0, 2.0])?;
    let timing = backend.time(|b| {
        b.exp(x)?;
        Ok(())
    })?;
    assert_eq!(timing.kernel_count(), 1);
    assert!(timing.wait()?.kernel_ms >= 0.0);
    assert_eq!(device.stats()?.queries, 0);
    Ok(())
}

#[test]
fn kernels_outside_regions_are_not_timed() -> Result<()> {
    let (device, mut backend) = backend_with(device(), BackendConfig::default());
    let x = f32_tensor(&mut backend, &[2], &[1.0, 2.0])?;
    backend.exp(x)?;
    assert_eq!(device.stats()?.queries, 0);
    Ok(())
}

#[test]
fn transfer_waits_reset_on_every_region() -> Result<()> {
    let config = BackendConfig::default()
        .with_async_readback(false)
        .with_timer_query(TimerQueryVersion::None);
    let (_device, mut backend) = backend_with(device(), config);
    let x = f32_tensor(&mut backend, &[3], &[1.0, 2.0, 3.0])?;
    let first = backend
        .time(|b| {
            let y = b.square(x)?;
            b.read_sync(y)?;
            Ok(())
        })?
        .wait()?;
    assert!(first.upload_wait_ms >= 0.0);
    assert!(first.download_wait_ms >= 0.0);

    let y = backend.neg(x)?;
    assert_eq!(read_f32(&mut backend, y)?, vec![-1.0, -2.0, -3.0]);
    let idle = backend.time(|_| Ok(()))?.wait()?;
    assert_eq!(idle.kernel_ms, 0.0);
    assert_eq!(idle.upload_wait_ms, 0.0);
    assert_eq!(idle.download_wait_ms, 0.0);
    Ok(())
}

#[test]
fn failing_regions_close_their_scope() -> Result<()> {
    let (_device, mut backend) = backend_with(device(), BackendConfig::default());
    let x = f32_tensor(&mut backend, &[2], &[1.0, 2.0])?;
    let failed = backend.time(|b| {
        b.exp(x)?;
        b.top_k_values(x, 1)?;
        Ok(())
    });
    assert!(matches!(failed, Err(BackendError::NotImplemented { .. })));

    let timing = backend.time(|b| {
        b.neg(x)?;
        Ok(())
    })?;
    assert_eq!(timing.kernel_count(), 1);
    timing.wait()?;
    Ok(())
}

#[test]
fn pending_timings_fail_after_dispose() -> Result<()> {
    let (_device, mut backend) = backend_with(device(), BackendConfig::default());
    let x = f32_tensor(&mut backend, &[2], &[1.0, 2.0])?;
    let timing = backend.time(|b| {
        b.exp(x)?;
        Ok(())
    })?;
    backend.dispose()?;
    assert_eq!(
        block_on(timing),
        Err(BackendError::BackendDisposed { handle: None })
    );
    Ok(())
}
