//! Callback wrapper that feeds the watchdog.

use crate::driver::{PeriodCallback, PeriodIo};
use crate::metering::CpuMeter;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The client callback, handed from one driver to the next across fallbacks.
///
/// Uses `UnsafeCell` for interior mutability. Only the audio thread of the
/// single running driver touches it; the manager stops a driver (which
/// joins its callback thread) before starting another. A driver that cannot
/// be stopped is abandoned and no other driver is started after it.
pub(crate) struct CallbackCell {
    inner: UnsafeCell<Box<dyn PeriodCallback>>,
}

unsafe impl Send for CallbackCell {}
unsafe impl Sync for CallbackCell {}

impl CallbackCell {
    pub(crate) fn new(callback: Box<dyn PeriodCallback>) -> Arc<Self> {
        Arc::new(Self {
            inner: UnsafeCell::new(callback),
        })
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn callback_mut(&self) -> &mut Box<dyn PeriodCallback> {
        &mut *self.inner.get()
    }
}

/// Underrun and stream-failure reports from the real-time side.
///
/// Every method is a single atomic increment, safe to call from the audio
/// thread.
#[derive(Debug, Default)]
pub struct XrunMonitor {
    underruns: AtomicU64,
    stream_failures: AtomicU64,
}

impl XrunMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// One period affected by an underrun (disk or hardware).
    #[inline]
    pub fn report_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::AcqRel);
    }

    /// A stream stayed outside its water marks beyond tolerance.
    #[inline]
    pub fn report_stream_failure(&self) {
        self.stream_failures.fetch_add(1, Ordering::AcqRel);
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Acquire)
    }

    pub fn stream_failures(&self) -> u64 {
        self.stream_failures.load(Ordering::Acquire)
    }
}

pub(crate) struct MonitoredCallback {
    cell: Arc<CallbackCell>,
    heartbeat: Arc<AtomicU64>,
    xruns: Arc<XrunMonitor>,
    cpu: Arc<CpuMeter>,
    period: Duration,
}

impl MonitoredCallback {
    pub(crate) fn new(
        cell: Arc<CallbackCell>,
        heartbeat: Arc<AtomicU64>,
        xruns: Arc<XrunMonitor>,
        cpu: Arc<CpuMeter>,
        period: Duration,
    ) -> Self {
        Self {
            cell,
            heartbeat,
            xruns,
            cpu,
            period,
        }
    }
}

impl PeriodCallback for MonitoredCallback {
    #[inline]
    fn process(&mut self, io: &mut PeriodIo<'_>) {
        let started = Instant::now();
        if io.hardware_xrun {
            self.xruns.report_underrun();
        }

        let cell = &self.cell;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
            cell.callback_mut().process(io)
        }));
        if result.is_err() {
            tracing::error!("period callback panicked, output silenced");
            io.output.silence();
            self.xruns.report_stream_failure();
        }

        self.cpu.record(started.elapsed(), self.period);
        self.heartbeat.fetch_add(1, Ordering::AcqRel);
    }
}
