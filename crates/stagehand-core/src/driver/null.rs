//! Null backend: a timer thread that calls back every period and discards audio.

use super::clock::{ClockControl, ClockThread, Pools};
use super::{Backend, DeviceSession, PeriodCallback};
use crate::config::{BackendKind, DeviceConfig};
use crate::error::DriverError;
use crate::pool::{BufferPool, PoolStats};
use std::sync::Arc;

/// Terminal fallback backend. Opening never fails.
pub struct NullDriver {
    control: ClockControl,
    stats: Arc<PoolStats>,
    session: Option<DeviceSession>,
    pools: Option<Pools>,
    clock: Option<ClockThread>,
}

impl NullDriver {
    pub fn new() -> Self {
        Self::with_control(ClockControl::new())
    }

    /// Use an externally held control handle, e.g. to observe cycle counts.
    pub fn with_control(control: ClockControl) -> Self {
        Self {
            control,
            stats: PoolStats::new(),
            session: None,
            pools: None,
            clock: None,
        }
    }

    pub fn control(&self) -> &ClockControl {
        &self.control
    }
}

impl Default for NullDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for NullDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Null
    }

    fn open(&mut self, config: &DeviceConfig) -> Result<DeviceSession, DriverError> {
        self.close();

        let session = DeviceSession::from_config(BackendKind::Null, BackendKind::Null.name(), config);
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
            "stagehand-null-clock",
            session.period_duration(),
            pools,
            self.control.clone(),
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
    }

    fn session(&self) -> Option<&DeviceSession> {
        self.session.as_ref()
    }

    fn device_lost(&self) -> bool {
        false
    }

    fn pool_stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }
}

impl Drop for NullDriver {
    fn drop(&mut self) {
        self.close();
    }
}
