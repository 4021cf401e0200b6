//! Device manager behaviour against the simulated backend.
//!
//! Run with:
//! ```bash
//! cargo test -p stagehand-core --test device_manager
//! ```

mod helpers;

use helpers::*;
use stagehand_core::prelude::*;
use stagehand_core::{
    ClockControl, DriverError, DummyBehavior, DummyDriver, Driver, FallbackReason,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn collect(manager: &DeviceManager, into: &mut Vec<StatusEvent>) {
    into.extend(manager.poll_events());
}

#[test]
fn stalled_driver_falls_back_to_null_with_fatal_event() {
    init_tracing();
    let behavior = dummy("dm-stall");
    let control = behavior.control.clone();
    let (callback, periods) = counting_callback();

    let manager = DeviceManager::builder()
        .config(config("dm-stall"))
        .preferences(vec![BackendKind::Dummy])
        .watchdog(fast_watchdog())
        .dummy(behavior)
        .start(callback)
        .unwrap();
    assert_eq!(manager.backend(), Some(BackendKind::Dummy));
    assert!(wait_until(SETTLE, || periods.load(Ordering::Relaxed) > 2));

    control.halt();
    assert!(wait_until(SETTLE, || manager.backend() == Some(BackendKind::Null)));
    assert_eq!(manager.state(), DeviceState::Running);

    let mut events = Vec::new();
    collect(&manager, &mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, StatusEvent::DriverStalled { backend: BackendKind::Dummy })));
    let fallback = events
        .iter()
        .find(|e| matches!(e, StatusEvent::SwitchedToNull { .. }))
        .copied()
        .unwrap();
    assert_eq!(
        fallback,
        StatusEvent::SwitchedToNull {
            reason: FallbackReason::Stalled
        }
    );
    assert_eq!(fallback.severity(), Severity::Fatal);

    // The same callback keeps running on the Null clock.
    let before = periods.load(Ordering::Relaxed);
    assert!(wait_until(SETTLE, || periods.load(Ordering::Relaxed) > before + 2));
}

#[test]
fn underrun_storm_falls_back_exactly_once() {
    let behavior = dummy("dm-storm");
    let control = behavior.control.clone();
    let (callback, _) = counting_callback();

    let manager = DeviceManager::builder()
        .config(config("dm-storm"))
        .preferences(vec![BackendKind::Dummy])
        .watchdog(fast_watchdog())
        .dummy(behavior)
        .start(callback)
        .unwrap();

    control.inject_xruns(5);
    assert!(wait_until(SETTLE, || manager.backend() == Some(BackendKind::Null)));

    // Keep the storm going on Null: no further switching.
    let monitor = manager.xrun_monitor();
    for _ in 0..20 {
        monitor.report_underrun();
        std::thread::sleep(Duration::from_millis(10));
    }
    std::thread::sleep(Duration::from_millis(200));

    let mut events = Vec::new();
    collect(&manager, &mut events);
    let switches = count_matching(&events, |e| matches!(e, StatusEvent::SwitchedToNull { .. }));
    assert_eq!(switches, 1);
    assert!(events.contains(&StatusEvent::SwitchedToNull {
        reason: FallbackReason::UnderrunStorm
    }));
    assert_eq!(
        count_matching(&events, |e| matches!(e, StatusEvent::XrunStorm { .. })),
        1
    );
    assert_eq!(manager.backend(), Some(BackendKind::Null));
    assert_eq!(manager.state(), DeviceState::Running);
}

#[test]
fn few_underruns_do_not_trigger_fallback() {
    let behavior = dummy("dm-calm");
    let control = behavior.control.clone();
    let (callback, _) = counting_callback();

    let manager = DeviceManager::builder()
        .config(config("dm-calm"))
        .preferences(vec![BackendKind::Dummy])
        .watchdog(fast_watchdog())
        .dummy(behavior)
        .start(callback)
        .unwrap();

    control.inject_xruns(3);
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(manager.backend(), Some(BackendKind::Dummy));
    assert!(manager.xrun_monitor().underruns() >= 3);
}

#[test]
fn stalled_null_driver_is_unrecoverable() {
    let null_control = ClockControl::new();
    let (callback, _) = counting_callback();

    let manager = DeviceManager::builder()
        .preferences(vec![BackendKind::Null])
        .watchdog(fast_watchdog())
        .null_control(null_control.clone())
        .start(callback)
        .unwrap();
    assert_eq!(manager.backend(), Some(BackendKind::Null));

    null_control.halt();
    assert!(wait_until(SETTLE, || manager.state() == DeviceState::Failed));

    let events = manager.poll_events();
    assert!(events.contains(&StatusEvent::Unrecoverable));
    assert_eq!(StatusEvent::Unrecoverable.severity(), Severity::Fatal);
    assert!(manager.switch_driver(vec![BackendKind::Null]).is_err());
}

#[test]
fn underrun_storm_on_null_posts_no_storm_event() {
    let (callback, _) = counting_callback();
    let manager = DeviceManager::builder()
        .preferences(vec![BackendKind::Null])
        .watchdog(fast_watchdog())
        .start(callback)
        .unwrap();

    let monitor = manager.xrun_monitor();
    for _ in 0..20 {
        monitor.report_underrun();
        std::thread::sleep(Duration::from_millis(10));
    }
    std::thread::sleep(Duration::from_millis(200));

    let events = manager.poll_events();
    assert_eq!(
        count_matching(&events, |e| matches!(e, StatusEvent::XrunStorm { .. })),
        0
    );
    assert_eq!(manager.backend(), Some(BackendKind::Null));
    assert_eq!(manager.state(), DeviceState::Running);
}

#[test]
fn callback_blocked_forever_is_abandoned_without_restarting() {
    init_tracing();
    let blocked = Arc::new(AtomicBool::new(false));
    let periods = Arc::new(AtomicU64::new(0));
    let (b, p) = (Arc::clone(&blocked), Arc::clone(&periods));
    let callback = move |io: &mut PeriodIo<'_>| {
        io.output.silence();
        while b.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
        p.fetch_add(1, Ordering::Relaxed);
    };

    let mut manager = DeviceManager::builder()
        .config(config("dm-blocked"))
        .preferences(vec![BackendKind::Dummy])
        .watchdog(fast_watchdog())
        .dummy(dummy("dm-blocked"))
        .start(Box::new(callback))
        .unwrap();
    assert!(wait_until(SETTLE, || periods.load(Ordering::Relaxed) > 2));

    blocked.store(true, Ordering::Release);
    let started = Instant::now();
    assert!(wait_until(SETTLE, || manager.state() == DeviceState::Failed));
    assert!(started.elapsed() < SETTLE);

    let events = manager.poll_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, StatusEvent::DriverStalled { backend: BackendKind::Dummy })));
    assert!(events.contains(&StatusEvent::Unrecoverable));
    assert_eq!(
        count_matching(&events, |e| matches!(e, StatusEvent::SwitchedToNull { .. })),
        0
    );
    assert_eq!(manager.backend(), None);

    // No other driver picks the callback up while the stuck thread holds it.
    let stuck_at = periods.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(periods.load(Ordering::Relaxed), stuck_at);

    // Once released, the abandoned thread finishes its period and exits.
    blocked.store(false, Ordering::Release);
    assert!(wait_until(SETTLE, || periods.load(Ordering::Relaxed) == stuck_at + 1));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(periods.load(Ordering::Relaxed), stuck_at + 1);

    manager.stop();
    assert_eq!(manager.state(), DeviceState::Failed);
}

#[test]
fn panicking_callback_reports_stream_failure_and_falls_back() {
    init_tracing();
    let periods = Arc::new(AtomicU64::new(0));
    let p = Arc::clone(&periods);
    let callback = move |io: &mut PeriodIo<'_>| {
        io.output.silence();
        if p.fetch_add(1, Ordering::Relaxed) == 3 {
            panic!("mixer bug");
        }
    };

    let manager = DeviceManager::builder()
        .config(config("dm-panic"))
        .preferences(vec![BackendKind::Dummy])
        .watchdog(fast_watchdog())
        .dummy(dummy("dm-panic"))
        .start(Box::new(callback))
        .unwrap();

    let mut events = Vec::new();
    assert!(wait_until(SETTLE, || {
        collect(&manager, &mut events);
        events
            .iter()
            .any(|e| matches!(e, StatusEvent::SwitchedToNull { .. }))
    }));
    assert!(events.contains(&StatusEvent::SwitchedToNull {
        reason: FallbackReason::StreamFailure
    }));
    assert_eq!(manager.xrun_monitor().stream_failures(), 1);
    assert_eq!(manager.backend(), Some(BackendKind::Null));

    // The callback survived the panic and keeps running on Null.
    let before = periods.load(Ordering::Relaxed);
    assert!(wait_until(SETTLE, || periods.load(Ordering::Relaxed) > before + 2));
}

#[test]
fn open_close_leaves_no_buffers_and_repeats() {
    for _ in 0..3 {
        let (callback, _) = counting_callback();
        let mut manager = DeviceManager::builder()
            .config(config("dm-cycle"))
            .preferences(vec![BackendKind::Dummy])
            .dummy(dummy("dm-cycle"))
            .start(callback)
            .unwrap();
        let stats = manager.pool_stats().unwrap();
        assert!(stats.allocated_samples() > 0);

        manager.stop();
        assert!(stats.is_idle());
        assert_eq!(manager.state(), DeviceState::NoDriver);
        assert_eq!(manager.device_name(), "No Device Configured");

        manager.stop();
        assert!(stats.is_idle());
    }
}

#[test]
fn unsupported_duplex_downgrades_to_playback() {
    let behavior = DummyBehavior {
        full_duplex: false,
        ..dummy("dm-half")
    };
    let (callback, _) = counting_callback();

    let manager = DeviceManager::builder()
        .config(config("dm-half"))
        .preferences(vec![BackendKind::Dummy])
        .dummy(behavior)
        .start(callback)
        .unwrap();

    let session = manager.session().unwrap();
    assert_eq!(session.backend, BackendKind::Dummy);
    assert_eq!(session.duplex, DuplexMode::Playback);

    let events = manager.poll_events();
    assert!(events.contains(&StatusEvent::DuplexDowngraded {
        from: DuplexMode::Full,
        to: DuplexMode::Playback
    }));
    assert!(events.iter().all(|e| e.severity() < Severity::Critical));
}

#[test]
fn unsupported_rate_is_renegotiated() {
    let behavior = DummyBehavior {
        rates: vec![SampleRate::Hz48000],
        ..dummy("dm-rate")
    };
    let (callback, _) = counting_callback();

    let manager = DeviceManager::builder()
        .config(config("dm-rate"))
        .preferences(vec![BackendKind::Dummy])
        .dummy(behavior)
        .start(callback)
        .unwrap();

    let session = manager.session().unwrap();
    assert_eq!(session.sample_rate, SampleRate::Hz48000);
    assert_eq!(session.duplex, DuplexMode::Full);
    assert!(manager.poll_events().contains(&StatusEvent::RateRenegotiated {
        requested: SampleRate::Hz44100,
        actual: SampleRate::Hz48000
    }));
}

#[test]
fn busy_device_reports_creation_failure_and_uses_null() {
    let mut holder = Driver::from(DummyDriver::new(dummy("dm-busy")));
    holder.open(&config("dm-busy")).unwrap();

    let (callback, _) = counting_callback();
    let manager = DeviceManager::builder()
        .config(config("dm-busy"))
        .preferences(vec![BackendKind::Dummy])
        .dummy(dummy("dm-busy"))
        .start(callback)
        .unwrap();

    assert_eq!(manager.backend(), Some(BackendKind::Null));
    let events = manager.poll_events();
    assert_eq!(
        events[0],
        StatusEvent::DriverCreationFailed {
            backend: BackendKind::Dummy,
            error: DriverError::DeviceBusy
        }
    );
    assert!(events.contains(&StatusEvent::SwitchedToNull {
        reason: FallbackReason::CreationFailed
    }));
    holder.close();
}

#[test]
fn switch_driver_moves_callback_between_backends() {
    let (callback, periods) = counting_callback();
    let manager = DeviceManager::builder()
        .config(config("dm-switch"))
        .preferences(vec![BackendKind::Null])
        .watchdog(fast_watchdog())
        .dummy(dummy("dm-switch"))
        .start(callback)
        .unwrap();
    assert_eq!(manager.backend(), Some(BackendKind::Null));
    assert!(wait_until(SETTLE, || periods.load(Ordering::Relaxed) > 0));

    let session = manager.switch_driver(vec![BackendKind::Dummy]).unwrap();
    assert_eq!(session.backend, BackendKind::Dummy);
    assert_eq!(session.device_name, "Dummy Device");

    let before = periods.load(Ordering::Relaxed);
    assert!(wait_until(SETTLE, || periods.load(Ordering::Relaxed) > before + 2));
    assert_eq!(manager.backend(), Some(BackendKind::Dummy));
}

#[test]
fn failing_open_walks_preference_list() {
    let behavior = DummyBehavior {
        open_error: Some(DriverError::PermissionDenied),
        ..dummy("dm-denied")
    };
    let (callback, _) = counting_callback();
    let manager = DeviceManager::builder()
        .config(config("dm-denied"))
        .preferences(vec![BackendKind::Dummy, BackendKind::Null])
        .dummy(behavior)
        .start(callback)
        .unwrap();

    assert_eq!(manager.backend(), Some(BackendKind::Null));
    assert_eq!(manager.device_name(), "Null Driver");
    assert!(manager.poll_events().contains(&StatusEvent::DriverCreationFailed {
        backend: BackendKind::Dummy,
        error: DriverError::PermissionDenied
    }));
}

#[test]
fn latency_follows_session() {
    let (callback, _) = counting_callback();
    let manager = DeviceManager::builder()
        .config(DeviceConfig {
            sample_rate: SampleRate::Hz48000,
            period_size: 480_usize.next_power_of_two(),
            period_count: 2,
            ..config("dm-latency")
        })
        .preferences(vec![BackendKind::Null])
        .start(callback)
        .unwrap();
    let expected = 512.0 * 2.0 / 48_000.0 * 1000.0;
    assert!((manager.buffer_latency_ms() - expected).abs() < 1e-9);
}
