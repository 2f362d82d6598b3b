//! Nested kernel timing.
//!
//! Each `time` call opens a scope that collects one pending duration per
//! kernel launched inside it. A closed scope is attached to its parent, so an
//! outer measurement includes every nested one. Durations backed by device
//! timer queries resolve later; [`TimingFuture`] polls them.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;

use serde::Serialize;

use crate::device::{DeviceCapabilities, DevicePoll, GpgpuDevice, QueryId};
use crate::error::{BackendError, BackendResult};

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct TimingInfo {
    /// Sum of the kernel durations recorded in the region, nested regions included.
    pub kernel_ms: f64,
    /// Host time spent uploading tensors while any timer scope was open.
    pub upload_wait_ms: f64,
    /// Host time spent in blocking downloads while any timer scope was open.
    pub download_wait_ms: f64,
    pub wall_ms: f64,
}

/// One kernel duration, shared between every scope that contains it.
pub(crate) struct PendingTimer {
    query: Option<QueryId>,
    settled: Mutex<Option<f64>>,
}

impl PendingTimer {
    fn elapsed(ms: f64) -> Arc<Self> {
        Arc::new(Self {
            query: None,
            settled: Mutex::new(Some(ms)),
        })
    }

    fn query(query: QueryId) -> Arc<Self> {
        Arc::new(Self {
            query: Some(query),
            settled: Mutex::new(None),
        })
    }

    fn poll(&self, device: &dyn GpgpuDevice) -> DevicePoll<f64> {
        let Ok(mut settled) = self.settled.lock() else {
            return DevicePoll::Failed(BackendError::device("timer mutex poisoned"));
        };
        if let Some(ms) = *settled {
            return DevicePoll::Ready(ms);
        }
        let Some(query) = self.query else {
            return DevicePoll::Ready(0.0);
        };
        let polled = device.poll_query(query);
        if let DevicePoll::Ready(ms) = polled {
            *settled = Some(ms);
        }
        polled
    }
}

/// A started kernel timer.
pub(crate) enum TimerStart {
    Query(QueryId),
    Host(Instant),
}

impl TimerStart {
    pub(crate) fn begin(
        device: &dyn GpgpuDevice,
        caps: &DeviceCapabilities,
    ) -> BackendResult<Self> {
        if caps.timer_query.is_supported() {
            Ok(TimerStart::Query(device.begin_query()?))
        } else {
            Ok(TimerStart::Host(Instant::now()))
        }
    }

    pub(crate) fn end(self, device: &dyn GpgpuDevice) -> BackendResult<Arc<PendingTimer>> {
        match self {
            TimerStart::Query(query) => {
                device.end_query(query)?;
                Ok(PendingTimer::query(query))
            }
            TimerStart::Host(start) => Ok(PendingTimer::elapsed(
                start.elapsed().as_secs_f64() * 1000.0,
            )),
        }
    }
}

enum TimerNode {
    Kernel(Arc<PendingTimer>),
    Scope(Vec<TimerNode>),
}

fn flatten(nodes: &[TimerNode], out: &mut Vec<Arc<PendingTimer>>) {
    for node in nodes {
        match node {
            TimerNode::Kernel(timer) => out.push(Arc::clone(timer)),
            TimerNode::Scope(children) => flatten(children, out),
        }
    }
}

/// Stack of open timer scopes plus the transfer wait accumulators.
#[derive(Default)]
pub(crate) struct TimerStack {
    scopes: Vec<Vec<TimerNode>>,
    upload_wait_ms: f64,
    download_wait_ms: f64,
}

impl TimerStack {
    pub(crate) fn is_active(&self) -> bool {
        !self.scopes.is_empty()
    }

    pub(crate) fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    /// Closes the innermost scope, hands it to the parent and returns its
    /// flattened timers.
    pub(crate) fn pop_scope(&mut self) -> Vec<Arc<PendingTimer>> {
        let Some(scope) = self.scopes.pop() else {
            return Vec::new();
        };
        let mut timers = Vec::new();
        flatten(&scope, &mut timers);
        if let Some(parent) = self.scopes.last_mut() {
            parent.push(TimerNode::Scope(scope));
        }
        timers
    }

    pub(crate) fn record_kernel(&mut self, timer: Arc<PendingTimer>) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(TimerNode::Kernel(timer));
        }
    }

    pub(crate) fn add_upload_wait(&mut self, start: Instant) {
        self.upload_wait_ms += start.elapsed().as_secs_f64() * 1000.0;
    }

    pub(crate) fn add_download_wait(&mut self, start: Instant) {
        self.download_wait_ms += start.elapsed().as_secs_f64() * 1000.0;
    }

    /// Returns the accumulated waits and zeroes them.
    pub(crate) fn take_waits(&mut self) -> (f64, f64) {
        let waits = (self.upload_wait_ms, self.download_wait_ms);
        self.upload_wait_ms = 0.0;
        self.download_wait_ms = 0.0;
        waits
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Resolves to the [`TimingInfo`] of a timed region once every kernel
/// duration in it is available.
#[must_use = "timings are only reported when the future is awaited"]
pub struct TimingFuture {
    device: Arc<dyn GpgpuDevice>,
    backend_epoch: Arc<AtomicU32>,
    started_epoch: u32,
    timers: Vec<Arc<PendingTimer>>,
    info: TimingInfo,
}

impl TimingFuture {
    pub(crate) fn new(
        device: Arc<dyn GpgpuDevice>,
        backend_epoch: Arc<AtomicU32>,
        started_epoch: u32,
        timers: Vec<Arc<PendingTimer>>,
        info: TimingInfo,
    ) -> Self {
        Self {
            device,
            backend_epoch,
            started_epoch,
            timers,
            info,
        }
    }

    /// Number of kernel durations this region is waiting on.
    pub fn kernel_count(&self) -> usize {
        self.timers.len()
    }

    /// Blocks the current thread until the timing resolves.
    pub fn wait(self) -> BackendResult<TimingInfo> {
        futures::executor::block_on(self)
    }
}

impl Future for TimingFuture {
    type Output = BackendResult<TimingInfo>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.backend_epoch.load(Ordering::Acquire) != this.started_epoch {
            return Poll::Ready(Err(BackendError::BackendDisposed { handle: None }));
        }
        let mut kernel_ms = 0.0;
        let mut pending = false;
        for timer in &this.timers {
            match timer.poll(this.device.as_ref()) {
                DevicePoll::Ready(ms) => kernel_ms += ms,
                DevicePoll::Pending => pending = true,
                DevicePoll::Failed(err) => return Poll::Ready(Err(err)),
            }
        }
        if pending {
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        Poll::Ready(Ok(TimingInfo {
            kernel_ms,
            ..this.info
        }))
    }
}
