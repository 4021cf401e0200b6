//! Audio device manager.
//!
//! Owns the active [`Driver`], walks the backend preference list, negotiates
//! duplex mode and sample rate, and runs a watchdog thread that moves the
//! session to the Null backend when the driver hangs, loses its device, or
//! produces an underrun storm.

use super::monitor::{CallbackCell, MonitoredCallback, XrunMonitor};
use super::watchdog::{StallDetector, StormDetector};
use crate::config::{BackendKind, DeviceConfig, WatchdogConfig};
use crate::driver::{
    ClockControl, DeviceSession, Driver, DummyBehavior, DummyDriver, NullDriver, PeriodCallback,
};
use crate::error::{DriverError, Error, Result};
use crate::event::{FallbackReason, StatusEvent};
use crate::lockfree::AtomicFlag;
use crate::metering::{CpuMeter, CpuMetrics};
use crate::pool::PoolStats;
use arc_swap::ArcSwapOption;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Device name reported when no session is open.
pub const NO_DEVICE_NAME: &str = "No Device Configured";

/// Lifecycle of the managed device.
///
/// `NoDriver -> Opening -> Running -> {Stopping -> NoDriver, Stalled -> Opening(Null)}`.
/// `Failed` is terminal: the Null backend itself stopped calling back, or a
/// stalled driver could not be shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    NoDriver,
    Opening,
    Running,
    Stopping,
    Stalled,
    Failed,
}

impl DeviceState {
    fn to_u8(self) -> u8 {
        match self {
            DeviceState::NoDriver => 0,
            DeviceState::Opening => 1,
            DeviceState::Running => 2,
            DeviceState::Stopping => 3,
            DeviceState::Stalled => 4,
            DeviceState::Failed => 5,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => DeviceState::Opening,
            2 => DeviceState::Running,
            3 => DeviceState::Stopping,
            4 => DeviceState::Stalled,
            5 => DeviceState::Failed,
            _ => DeviceState::NoDriver,
        }
    }
}

struct Inner {
    driver: Option<Driver>,
    config: DeviceConfig,
    preferences: Vec<BackendKind>,
    dummy: DummyBehavior,
    null_control: ClockControl,
}

struct Shared {
    inner: Mutex<Inner>,
    state: AtomicU8,
    session: ArcSwapOption<DeviceSession>,
    callback: Arc<CallbackCell>,
    heartbeat: Arc<AtomicU64>,
    xruns: Arc<XrunMonitor>,
    cpu: Arc<CpuMeter>,
    events: Sender<StatusEvent>,
    watchdog: WatchdogConfig,
    shutdown: AtomicFlag,
    /// Bumped after every driver change so the watchdog discards stale
    /// observations.
    generation: AtomicU64,
}

impl Shared {
    fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: DeviceState) {
        let prev = DeviceState::from_u8(self.state.swap(state.to_u8(), Ordering::AcqRel));
        if prev != state {
            tracing::debug!("device state {:?} -> {:?}", prev, state);
        }
    }

    fn backend(&self) -> Option<BackendKind> {
        self.inner.lock().driver.as_ref().map(Driver::kind)
    }

    fn post(&self, event: StatusEvent) {
        let _ = self.events.send(event);
    }

    fn monitored(&self, session: &DeviceSession) -> Box<dyn PeriodCallback> {
        Box::new(MonitoredCallback::new(
            Arc::clone(&self.callback),
            Arc::clone(&self.heartbeat),
            Arc::clone(&self.xruns),
            Arc::clone(&self.cpu),
            session.period_duration(),
        ))
    }

    fn publish(&self, driver: Driver, session: DeviceSession, inner: &mut Inner) {
        tracing::info!(
            "{} running on \"{}\": {} Hz, {} x {} frames ({:.1} ms), {:?}",
            session.backend.name(),
            session.device_name,
            session.sample_rate.as_u32(),
            session.period_size,
            session.period_count,
            session.latency_ms(),
            session.duplex
        );
        inner.driver = Some(driver);
        self.session.store(Some(Arc::new(session)));
        self.cpu.reset();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.set_state(DeviceState::Running);
    }

    fn close_current(&self, inner: &mut Inner) {
        if let Some(mut driver) = inner.driver.take() {
            tracing::info!("closing {}", driver.kind().name());
            driver.close();
        }
        self.session.store(None);
    }

    /// Close the current driver from the stall path, where its callback may
    /// never return. Returns false if the driver was abandoned still running.
    fn close_stalled(&self, inner: &mut Inner) -> bool {
        self.session.store(None);
        let Some(driver) = inner.driver.take() else {
            return true;
        };
        let backend = driver.kind();
        tracing::info!("closing {}", backend.name());
        if close_within(driver, self.watchdog.stall_threshold) {
            return true;
        }
        tracing::error!(
            "{} did not shut down within {:?}, abandoning it",
            backend.name(),
            self.watchdog.stall_threshold
        );
        false
    }

    /// Open and start the first backend of the preference list that works,
    /// ending with Null.
    fn bring_up(&self, inner: &mut Inner) -> Result<()> {
        self.set_state(DeviceState::Opening);
        let mut failed = false;

        let preferences = inner.preferences.clone();
        let mut tried = Vec::new();
        for kind in preferences {
            if kind == BackendKind::Null || tried.contains(&kind) {
                continue;
            }
            tried.push(kind);

            let outcome = match make_driver(kind, &inner.dummy) {
                Some(mut driver) => self
                    .open_and_start(&mut driver, &inner.config)
                    .map(|session| (driver, session)),
                None => Err(DriverError::DeviceNotFound),
            };
            match outcome {
                Ok((driver, session)) => {
                    self.publish(driver, session, inner);
                    return Ok(());
                }
                Err(error) => {
                    tracing::warn!("{} failed to open: {}", kind.name(), error);
                    self.post(StatusEvent::DriverCreationFailed {
                        backend: kind,
                        error,
                    });
                    failed = true;
                }
            }
        }

        self.start_null(inner)?;
        if failed {
            tracing::error!("no preferred backend could be opened, using Null Driver");
            self.post(StatusEvent::SwitchedToNull {
                reason: FallbackReason::CreationFailed,
            });
        }
        Ok(())
    }

    fn open_and_start(
        &self,
        driver: &mut Driver,
        config: &DeviceConfig,
    ) -> std::result::Result<DeviceSession, DriverError> {
        let session = self.negotiate(driver, config)?;
        if let Err(e) = driver.start(self.monitored(&session)) {
            driver.close();
            return Err(e);
        }
        Ok(session)
    }

    /// Requested config first, then reduced duplex modes, then other rates
    /// nearest first.
    fn negotiate(
        &self,
        driver: &mut Driver,
        config: &DeviceConfig,
    ) -> std::result::Result<DeviceSession, DriverError> {
        match driver.open(config) {
            Err(DriverError::UnsupportedConfig) => {}
            other => return other,
        }

        for &mode in config.duplex.downgrades() {
            tracing::warn!(
                "{} does not support {:?}, trying {:?}",
                driver.kind().name(),
                config.duplex,
                mode
            );
            self.post(StatusEvent::DuplexDowngraded {
                from: config.duplex,
                to: mode,
            });
            match driver.open(&config.with_duplex(mode)) {
                Err(DriverError::UnsupportedConfig) => {}
                other => return other,
            }
        }

        let modes = std::iter::once(config.duplex).chain(config.duplex.downgrades().iter().copied());
        let modes: Vec<_> = modes.collect();
        for rate in config.sample_rate.alternatives() {
            for &mode in &modes {
                let candidate = config.with_sample_rate(rate).with_duplex(mode);
                match driver.open(&candidate) {
                    Ok(session) => {
                        tracing::warn!(
                            "{} Hz unsupported, renegotiated to {} Hz",
                            config.sample_rate.as_u32(),
                            rate.as_u32()
                        );
                        self.post(StatusEvent::RateRenegotiated {
                            requested: config.sample_rate,
                            actual: rate,
                        });
                        return Ok(session);
                    }
                    Err(DriverError::UnsupportedConfig) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Err(DriverError::UnsupportedConfig)
    }

    fn start_null(&self, inner: &mut Inner) -> Result<()> {
        let mut driver = Driver::from(NullDriver::with_control(inner.null_control.clone()));
        let started = driver
            .open(&inner.config)
            .and_then(|session| driver.start(self.monitored(&session)).map(|_| session));
        match started {
            Ok(session) => {
                self.publish(driver, session, inner);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Null Driver failed to start: {}", e);
                driver.close();
                self.set_state(DeviceState::Failed);
                self.post(StatusEvent::Unrecoverable);
                Err(Error::Unrecoverable)
            }
        }
    }

    /// Move to the Null backend. `seen` is the generation the decision was
    /// made under; a driver change since then makes it stale.
    fn fall_back(&self, reason: FallbackReason, seen: u64) {
        let mut inner = self.inner.lock();
        if self.generation.load(Ordering::Acquire) != seen || self.state() != DeviceState::Running {
            return;
        }
        let Some(backend) = inner.driver.as_ref().map(Driver::kind) else {
            return;
        };

        if backend == BackendKind::Null {
            if reason == FallbackReason::Stalled {
                tracing::error!("Null Driver stopped calling back, audio engine cannot recover");
                self.close_stalled(&mut inner);
                self.post(StatusEvent::Unrecoverable);
                self.set_state(DeviceState::Failed);
            } else {
                tracing::warn!("{:?} while on Null Driver, ignoring", reason);
            }
            return;
        }

        if reason == FallbackReason::Stalled {
            self.set_state(DeviceState::Stalled);
            tracing::error!("{} stalled, forcing close", backend.name());
            self.post(StatusEvent::DriverStalled { backend });
            // A thread still inside the callback owns it; nothing else may run it.
            if !self.close_stalled(&mut inner) {
                self.post(StatusEvent::Unrecoverable);
                self.set_state(DeviceState::Failed);
                return;
            }
        } else {
            self.set_state(DeviceState::Stopping);
            tracing::error!("{} failed ({:?}), switching to Null Driver", backend.name(), reason);
            self.close_current(&mut inner);
        }

        self.set_state(DeviceState::Opening);
        if self.start_null(&mut inner).is_ok() {
            self.post(StatusEvent::SwitchedToNull { reason });
        }
    }
}

/// Close `driver` on a helper thread and wait at most `timeout` for it.
/// On timeout the helper keeps the driver and finishes whenever the driver
/// lets go.
fn close_within(mut driver: Driver, timeout: Duration) -> bool {
    let (done_tx, done_rx) = bounded(1);
    let spawned = thread::Builder::new()
        .name("stagehand-driver-close".into())
        .spawn(move || {
            driver.close();
            let _ = done_tx.send(());
        });
    match spawned {
        Ok(_) => done_rx.recv_timeout(timeout).is_ok(),
        Err(e) => {
            tracing::error!("could not spawn driver close thread: {}", e);
            false
        }
    }
}

fn make_driver(kind: BackendKind, dummy: &DummyBehavior) -> Option<Driver> {
    match kind {
        BackendKind::Dummy => Some(Driver::from(DummyDriver::new(dummy.clone()))),
        BackendKind::Null => Some(Driver::from(NullDriver::new())),
        #[cfg(feature = "hardware")]
        BackendKind::Alsa | BackendKind::Jack | BackendKind::PortAudio => {
            Some(Driver::Cpal(crate::driver::CpalDriver::new(kind)))
        }
        #[cfg(not(feature = "hardware"))]
        BackendKind::Alsa | BackendKind::Jack | BackendKind::PortAudio => None,
    }
}

fn run_watchdog(shared: Arc<Shared>) {
    let cfg = shared.watchdog;
    let mut seen = shared.generation.load(Ordering::Acquire);
    let mut stall = StallDetector::new(
        cfg.stall_threshold,
        shared.heartbeat.load(Ordering::Acquire),
        Instant::now(),
    );
    let mut storm = StormDetector::new(cfg.storm_threshold, cfg.storm_window);
    let mut last_underruns = shared.xruns.underruns();
    let mut last_failures = shared.xruns.stream_failures();

    loop {
        thread::park_timeout(cfg.check_interval);
        if shared.shutdown.get() {
            break;
        }

        let now = Instant::now();
        let generation = shared.generation.load(Ordering::Acquire);
        let heartbeat = shared.heartbeat.load(Ordering::Acquire);
        let underruns = shared.xruns.underruns();
        let failures = shared.xruns.stream_failures();

        if generation != seen || shared.state() != DeviceState::Running {
            seen = generation;
            stall.reset(heartbeat, now);
            storm.clear();
            last_underruns = underruns;
            last_failures = failures;
            continue;
        }

        let new_underruns = underruns.saturating_sub(last_underruns);
        let new_failures = failures.saturating_sub(last_failures);
        last_underruns = underruns;
        last_failures = failures;

        if stall.observe(heartbeat, now) {
            shared.fall_back(FallbackReason::Stalled, seen);
            continue;
        }

        let lost = shared
            .inner
            .lock()
            .driver
            .as_ref()
            .is_some_and(Driver::device_lost);
        if lost {
            shared.fall_back(FallbackReason::DeviceLost, seen);
            continue;
        }

        if new_failures > 0 {
            shared.fall_back(FallbackReason::StreamFailure, seen);
            continue;
        }

        if storm.record(new_underruns, now) {
            let count = storm.count();
            storm.clear();
            tracing::warn!("underrun storm: {} periods within {:?}", count, cfg.storm_window);
            if shared.backend() == Some(BackendKind::Null) {
                tracing::warn!("underrun storm while on Null Driver, ignoring");
                continue;
            }
            shared.post(StatusEvent::XrunStorm { count });
            shared.fall_back(FallbackReason::UnderrunStorm, seen);
        }
    }
    tracing::debug!("watchdog exiting");
}

/// Builder for [`DeviceManager`].
pub struct DeviceManagerBuilder {
    config: DeviceConfig,
    preferences: Vec<BackendKind>,
    watchdog: WatchdogConfig,
    dummy: DummyBehavior,
    null_control: ClockControl,
    xruns: Option<Arc<XrunMonitor>>,
}

impl Default for DeviceManagerBuilder {
    fn default() -> Self {
        Self {
            config: DeviceConfig::default(),
            preferences: crate::driver::available_backends(),
            watchdog: WatchdogConfig::default(),
            dummy: DummyBehavior::default(),
            null_control: ClockControl::new(),
            xruns: None,
        }
    }
}

impl DeviceManagerBuilder {
    pub fn config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    /// Ordered backend preference. Null is always tried last whether listed
    /// or not.
    pub fn preferences(mut self, preferences: Vec<BackendKind>) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Behaviour of the simulated device used for [`BackendKind::Dummy`].
    pub fn dummy(mut self, behavior: DummyBehavior) -> Self {
        self.dummy = behavior;
        self
    }

    /// Clock control handed to every Null backend this manager creates.
    pub fn null_control(mut self, control: ClockControl) -> Self {
        self.null_control = control;
        self
    }

    /// Share an xrun monitor with the period callback so disk underruns count
    /// towards storm detection.
    pub fn xrun_monitor(mut self, monitor: Arc<XrunMonitor>) -> Self {
        self.xruns = Some(monitor);
        self
    }

    /// Open a backend, start `callback` on it and spawn the watchdog.
    pub fn start(self, callback: Box<dyn PeriodCallback>) -> Result<DeviceManager> {
        self.config.validate()?;
        self.watchdog.validate()?;

        let (tx, rx) = unbounded();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                driver: None,
                config: self.config,
                preferences: self.preferences,
                dummy: self.dummy,
                null_control: self.null_control,
            }),
            state: AtomicU8::new(DeviceState::NoDriver.to_u8()),
            session: ArcSwapOption::empty(),
            callback: CallbackCell::new(callback),
            heartbeat: Arc::new(AtomicU64::new(0)),
            xruns: self.xruns.unwrap_or_else(XrunMonitor::new),
            cpu: Arc::new(CpuMeter::new()),
            events: tx,
            watchdog: self.watchdog,
            shutdown: AtomicFlag::new(false),
            generation: AtomicU64::new(0),
        });

        {
            let mut inner = shared.inner.lock();
            shared.bring_up(&mut inner)?;
        }

        let for_thread = Arc::clone(&shared);
        let watchdog = thread::Builder::new()
            .name("stagehand-watchdog".into())
            .spawn(move || run_watchdog(for_thread));
        let watchdog = match watchdog {
            Ok(handle) => handle,
            Err(e) => {
                let mut inner = shared.inner.lock();
                shared.close_current(&mut inner);
                shared.set_state(DeviceState::NoDriver);
                return Err(Error::ThreadSpawn(e));
            }
        };

        Ok(DeviceManager {
            shared,
            events: rx,
            watchdog: Some(watchdog),
        })
    }
}

/// Owns the active driver session. Process-scoped: create one and pass it
/// to whoever needs device parameters.
pub struct DeviceManager {
    shared: Arc<Shared>,
    events: Receiver<StatusEvent>,
    watchdog: Option<JoinHandle<()>>,
}

impl DeviceManager {
    pub fn builder() -> DeviceManagerBuilder {
        DeviceManagerBuilder::default()
    }

    pub fn state(&self) -> DeviceState {
        self.shared.state()
    }

    /// Snapshot of the current session. Lock-free.
    pub fn session(&self) -> Option<Arc<DeviceSession>> {
        self.shared.session.load_full()
    }

    pub fn backend(&self) -> Option<BackendKind> {
        self.session().map(|s| s.backend)
    }

    pub fn device_name(&self) -> String {
        self.session()
            .map(|s| s.device_name.clone())
            .unwrap_or_else(|| NO_DEVICE_NAME.to_string())
    }

    pub fn buffer_latency_ms(&self) -> f64 {
        self.session().map_or(0.0, |s| s.latency_ms())
    }

    pub fn xrun_monitor(&self) -> Arc<XrunMonitor> {
        Arc::clone(&self.shared.xruns)
    }

    pub fn cpu_metrics(&self) -> CpuMetrics {
        self.shared.cpu.metrics()
    }

    /// Periods the callback has completed across all drivers.
    pub fn callback_count(&self) -> u64 {
        self.shared.heartbeat.load(Ordering::Acquire)
    }

    /// Manager events (creation failures, downgrades, fallbacks).
    pub fn events(&self) -> Receiver<StatusEvent> {
        self.events.clone()
    }

    pub fn poll_events(&self) -> Vec<StatusEvent> {
        self.events.try_iter().collect()
    }

    pub fn pool_stats(&self) -> Option<Arc<PoolStats>> {
        self.shared.inner.lock().driver.as_ref().map(Driver::pool_stats)
    }

    /// Close the current driver and re-run backend selection. Blocks until
    /// the old driver's callback has stopped.
    pub fn switch_driver(&self, preferences: Vec<BackendKind>) -> Result<Arc<DeviceSession>> {
        let mut inner = self.shared.inner.lock();
        if self.shared.state() == DeviceState::Failed {
            return Err(Error::Unrecoverable);
        }
        tracing::info!("switching driver, preferences {:?}", preferences);
        self.shared.set_state(DeviceState::Stopping);
        self.shared.close_current(&mut inner);
        inner.preferences = preferences;
        self.shared.bring_up(&mut inner)?;
        self.session().ok_or(Error::NoSession)
    }

    /// Reopen with new device parameters on the current preference list.
    pub fn reconfigure(&self, config: DeviceConfig) -> Result<Arc<DeviceSession>> {
        config.validate()?;
        let mut inner = self.shared.inner.lock();
        if self.shared.state() == DeviceState::Failed {
            return Err(Error::Unrecoverable);
        }
        tracing::info!("reconfiguring device: {:?}", config);
        self.shared.set_state(DeviceState::Stopping);
        self.shared.close_current(&mut inner);
        inner.config = config;
        self.shared.bring_up(&mut inner)?;
        self.session().ok_or(Error::NoSession)
    }

    /// Stop the watchdog and close the driver. Idempotent.
    pub fn stop(&mut self) {
        let Some(watchdog) = self.watchdog.take() else {
            return;
        };
        self.shared.shutdown.set(true);
        watchdog.thread().unpark();
        let _ = watchdog.join();

        let mut inner = self.shared.inner.lock();
        if self.shared.state() != DeviceState::Failed {
            self.shared.set_state(DeviceState::Stopping);
        }
        self.shared.close_current(&mut inner);
        if self.shared.state() != DeviceState::Failed {
            self.shared.set_state(DeviceState::NoDriver);
        }
        tracing::info!("device manager stopped");
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.stop();
    }
}
