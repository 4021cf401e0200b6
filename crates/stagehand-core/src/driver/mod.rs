//! Driver backends.
//!
//! Every backend implements the same open / start / stop / close contract.
//! [`Driver`] is the closed set the device manager works with.
//!
//! After `stop()` returns the backend guarantees the period callback will
//! not be invoked again, so the caller may tear down anything it shares with
//! the callback.

mod claims;
mod clock;
#[cfg(feature = "hardware")]
mod hardware;
mod dummy;
mod null;

pub use clock::ClockControl;
#[cfg(feature = "hardware")]
pub use hardware::CpalDriver;
pub use dummy::{DummyBehavior, DummyDriver};
pub use null::NullDriver;

use crate::config::{BackendKind, DeviceConfig, DuplexMode, SampleRate};
use crate::error::DriverError;
use crate::pool::{PeriodBuffer, PoolStats};
use std::sync::Arc;
use std::time::Duration;

/// Buffers exchanged with the hardware for one period.
pub struct PeriodIo<'a> {
    pub input: PeriodBuffer<'a>,
    pub output: PeriodBuffer<'a>,
    pub frames: usize,
    /// The backend observed an xrun affecting this period.
    pub hardware_xrun: bool,
}

/// Real-time entry point invoked once per period.
///
/// Implementations must not block, allocate, or take locks a non-real-time
/// thread could hold.
pub trait PeriodCallback: Send + 'static {
    fn process(&mut self, io: &mut PeriodIo<'_>);
}

impl<F> PeriodCallback for F
where
    F: FnMut(&mut PeriodIo<'_>) + Send + 'static,
{
    fn process(&mut self, io: &mut PeriodIo<'_>) {
        self(io)
    }
}

/// Stereo (or trailing mono) grouping of device channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bus {
    pub name: String,
    pub left: usize,
    pub right: Option<usize>,
}

/// Operating parameters of an open device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSession {
    pub backend: BackendKind,
    pub device_id: String,
    pub device_name: String,
    pub sample_rate: SampleRate,
    pub period_size: usize,
    pub period_count: usize,
    pub input_channels: usize,
    pub output_channels: usize,
    pub duplex: DuplexMode,
}

impl DeviceSession {
    pub(crate) fn from_config(backend: BackendKind, device_name: &str, config: &DeviceConfig) -> Self {
        Self {
            backend,
            device_id: config.device_id.clone(),
            device_name: device_name.to_string(),
            sample_rate: config.sample_rate,
            period_size: config.period_size,
            period_count: config.period_count,
            input_channels: if config.duplex.has_capture() {
                config.input_channels
            } else {
                0
            },
            output_channels: if config.duplex.has_playback() {
                config.output_channels
            } else {
                0
            },
            duplex: config.duplex,
        }
    }

    pub fn period_duration(&self) -> Duration {
        Duration::from_secs_f64(self.period_size as f64 / self.sample_rate.as_f64())
    }

    pub fn latency(&self) -> Duration {
        Duration::from_secs_f64(
            (self.period_size * self.period_count) as f64 / self.sample_rate.as_f64(),
        )
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency().as_secs_f64() * 1000.0
    }

    pub fn capture_buses(&self) -> Vec<Bus> {
        pair_channels("Capture", self.input_channels)
    }

    pub fn playback_buses(&self) -> Vec<Bus> {
        pair_channels("Playback", self.output_channels)
    }
}

fn pair_channels(prefix: &str, channels: usize) -> Vec<Bus> {
    (0..channels)
        .step_by(2)
        .enumerate()
        .map(|(i, left)| Bus {
            name: format!("{prefix} {}", i + 1),
            left,
            right: (left + 1 < channels).then_some(left + 1),
        })
        .collect()
}

/// Capability set shared by all backends.
pub(crate) trait Backend: Send {
    fn kind(&self) -> BackendKind;
    fn open(&mut self, config: &DeviceConfig) -> Result<DeviceSession, DriverError>;
    fn start(&mut self, callback: Box<dyn PeriodCallback>) -> Result<(), DriverError>;
    fn stop(&mut self);
    fn close(&mut self);
    fn session(&self) -> Option<&DeviceSession>;
    fn device_lost(&self) -> bool;
    fn pool_stats(&self) -> Arc<PoolStats>;
}

/// The closed set of driver backends.
pub enum Driver {
    #[cfg(feature = "hardware")]
    Cpal(CpalDriver),
    Dummy(DummyDriver),
    Null(NullDriver),
}

impl Driver {
    fn backend(&self) -> &dyn Backend {
        match self {
            #[cfg(feature = "hardware")]
            Driver::Cpal(d) => d,
            Driver::Dummy(d) => d,
            Driver::Null(d) => d,
        }
    }

    fn backend_mut(&mut self) -> &mut dyn Backend {
        match self {
            #[cfg(feature = "hardware")]
            Driver::Cpal(d) => d,
            Driver::Dummy(d) => d,
            Driver::Null(d) => d,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend().kind()
    }

    /// Seize the device and allocate the session's period buffers.
    pub fn open(&mut self, config: &DeviceConfig) -> Result<DeviceSession, DriverError> {
        self.backend_mut().open(config)
    }

    pub fn start(&mut self, callback: Box<dyn PeriodCallback>) -> Result<(), DriverError> {
        self.backend_mut().start(callback)
    }

    /// Blocks until the callback can no longer run.
    pub fn stop(&mut self) {
        self.backend_mut().stop()
    }

    /// Stop, free the period buffers and release the device. Idempotent.
    pub fn close(&mut self) {
        self.backend_mut().close()
    }

    pub fn session(&self) -> Option<&DeviceSession> {
        self.backend().session()
    }

    pub fn device_lost(&self) -> bool {
        self.backend().device_lost()
    }

    pub fn pool_stats(&self) -> Arc<PoolStats> {
        self.backend().pool_stats()
    }
}

impl From<NullDriver> for Driver {
    fn from(d: NullDriver) -> Self {
        Driver::Null(d)
    }
}

impl From<DummyDriver> for Driver {
    fn from(d: DummyDriver) -> Self {
        Driver::Dummy(d)
    }
}

/// Backend kinds usable on this platform. Null is always last.
pub fn available_backends() -> Vec<BackendKind> {
    let mut kinds = Vec::new();
    #[cfg(all(feature = "hardware", target_os = "linux"))]
    kinds.push(BackendKind::Alsa);
    #[cfg(all(feature = "jack", target_os = "linux"))]
    kinds.push(BackendKind::Jack);
    #[cfg(feature = "hardware")]
    kinds.push(BackendKind::PortAudio);
    kinds.push(BackendKind::Null);
    kinds
}

/// Device names a backend kind can open.
pub fn list_devices(kind: BackendKind) -> Result<Vec<String>, DriverError> {
    match kind {
        BackendKind::Null => Ok(vec![BackendKind::Null.name().to_string()]),
        BackendKind::Dummy => Ok(vec!["dummy".to_string()]),
        #[cfg(feature = "hardware")]
        _ => hardware::list_devices(kind),
        #[cfg(not(feature = "hardware"))]
        _ => Err(DriverError::DeviceNotFound),
    }
}
