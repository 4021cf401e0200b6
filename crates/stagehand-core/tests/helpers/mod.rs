//! Shared fixtures for device-level tests.
//!
//! Device claims are process-wide and tests run in parallel, so every test
//! uses its own dummy device id.

#![allow(dead_code)]

use stagehand_core::{
    DeviceConfig, DummyBehavior, PeriodCallback, PeriodIo, StatusEvent, WatchdogConfig,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Generous upper bound for anything the watchdog has to notice.
pub const SETTLE: Duration = Duration::from_secs(5);

pub fn fast_watchdog() -> WatchdogConfig {
    WatchdogConfig {
        check_interval: Duration::from_millis(10),
        stall_threshold: Duration::from_millis(150),
        storm_threshold: 5,
        storm_window: Duration::from_secs(2),
    }
}

pub fn dummy(id: &str) -> DummyBehavior {
    DummyBehavior {
        device_id: id.into(),
        ..Default::default()
    }
}

pub fn config(id: &str) -> DeviceConfig {
    DeviceConfig {
        device_id: id.into(),
        period_size: 256,
        ..Default::default()
    }
}

/// Callback that only counts periods.
pub fn counting_callback() -> (Box<dyn PeriodCallback>, Arc<AtomicU64>) {
    let count = Arc::new(AtomicU64::new(0));
    let c = Arc::clone(&count);
    let callback = move |io: &mut PeriodIo<'_>| {
        io.output.silence();
        c.fetch_add(1, Ordering::Relaxed);
    };
    (Box::new(callback), count)
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn count_matching(events: &[StatusEvent], f: impl Fn(&StatusEvent) -> bool) -> usize {
    events.iter().filter(|e| f(e)).count()
}

/// Route `tracing` output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
