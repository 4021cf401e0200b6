//! Simulated hardware backend.
//!
//! Behaves like a real device (exclusive claim, duplex/rate support, failure
//! on open) but is clocked by a timer thread, so the device manager and the
//! scheduler can be exercised without audio hardware. Faults are injected
//! through the shared [`ClockControl`].

use super::claims::DeviceClaim;
use super::clock::{ClockControl, ClockThread, Pools};
use super::{Backend, DeviceSession, PeriodCallback};
use crate::config::{BackendKind, DeviceConfig, DuplexMode, SampleRate};
use crate::error::DriverError;
use crate::pool::{BufferPool, PoolStats};
use std::sync::Arc;

/// What the simulated device supports and how it misbehaves.
#[derive(Debug, Clone)]
pub struct DummyBehavior {
    pub device_id: String,
    pub playback: bool,
    pub capture: bool,
    /// Playback and capture may run concurrently.
    pub full_duplex: bool,
    /// Empty means every enumerated rate.
    pub rates: Vec<SampleRate>,
    /// Fail every open with this error.
    pub open_error: Option<DriverError>,
    pub control: ClockControl,
}

impl Default for DummyBehavior {
    fn default() -> Self {
        Self {
            device_id: "dummy".into(),
            playback: true,
            capture: true,
            full_duplex: true,
            rates: Vec::new(),
            open_error: None,
            control: ClockControl::new(),
        }
    }
}

impl DummyBehavior {
    fn supports(&self, duplex: DuplexMode) -> bool {
        match duplex {
            DuplexMode::Full => self.full_duplex && self.playback && self.capture,
            DuplexMode::Playback => self.playback,
            DuplexMode::Capture => self.capture,
        }
    }

    fn supports_rate(&self, rate: SampleRate) -> bool {
        self.rates.is_empty() || self.rates.contains(&rate)
    }
}

pub struct DummyDriver {
    behavior: DummyBehavior,
    stats: Arc<PoolStats>,
    claim: Option<DeviceClaim>,
    session: Option<DeviceSession>,
    pools: Option<Pools>,
    clock: Option<ClockThread>,
}

impl DummyDriver {
    pub fn new(behavior: DummyBehavior) -> Self {
        Self {
            behavior,
            stats: PoolStats::new(),
            claim: None,
            session: None,
            pools: None,
            clock: None,
        }
    }

    pub fn control(&self) -> &ClockControl {
        &self.behavior.control
    }
}

impl Backend for DummyDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Dummy
    }

    fn open(&mut self, config: &DeviceConfig) -> Result<DeviceSession, DriverError> {
        self.close();

        if let Some(err) = self.behavior.open_error {
            return Err(err);
        }
        if config.device_id != self.behavior.device_id && config.device_id != "default" {
            return Err(DriverError::DeviceNotFound);
        }
        let claim = DeviceClaim::acquire(&self.behavior.device_id)?;
        if !self.behavior.supports(config.duplex) || !self.behavior.supports_rate(config.sample_rate)
        {
            return Err(DriverError::UnsupportedConfig);
        }

        let mut session = DeviceSession::from_config(BackendKind::Dummy, "Dummy Device", config);
        session.device_id = self.behavior.device_id.clone();

        self.pools = Some(Pools {
            input: BufferPool::new(
                session.input_channels,
                session.period_size,
                session.period_count,
                Arc::clone(&self.stats),
            ),
            output: BufferPool::new(
                session.output_channels,
                session.period_size,
                session.period_count,
                Arc::clone(&self.stats),
            ),
        });
        self.claim = Some(claim);
        self.session = Some(session.clone());
        Ok(session)
    }

    fn start(&mut self, callback: Box<dyn PeriodCallback>) -> Result<(), DriverError> {
        if self.clock.is_some() {
            return Ok(());
        }
        let session = self.session.as_ref().ok_or(DriverError::Unknown)?;
        let pools = self.pools.take().ok_or(DriverError::Unknown)?;
        self.clock = Some(ClockThread::spawn(
            "stagehand-dummy-clock",
            session.period_duration(),
            pools,
            self.behavior.control.clone(),
            callback,
        )?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut clock) = self.clock.take() {
            if let Some(pools) = clock.stop() {
                self.pools = Some(pools);
            }
        }
    }

    fn close(&mut self) {
        self.stop();
        self.pools = None;
        self.session = None;
        self.claim = None;
    }

    fn session(&self) -> Option<&DeviceSession> {
        self.session.as_ref()
    }

    fn device_lost(&self) -> bool {
        self.behavior.control.device_lost()
    }

    fn pool_stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }
}

impl Drop for DummyDriver {
    fn drop(&mut self) {
        self.close();
    }
}
