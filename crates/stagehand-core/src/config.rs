//! Device and watchdog configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sample rates a device session may run at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum SampleRate {
    Hz22050,
    Hz32000,
    Hz44100,
    Hz48000,
    Hz88200,
    Hz96000,
}

impl SampleRate {
    pub const ALL: [SampleRate; 6] = [
        SampleRate::Hz22050,
        SampleRate::Hz32000,
        SampleRate::Hz44100,
        SampleRate::Hz48000,
        SampleRate::Hz88200,
        SampleRate::Hz96000,
    ];

    pub fn as_u32(self) -> u32 {
        match self {
            SampleRate::Hz22050 => 22050,
            SampleRate::Hz32000 => 32000,
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
            SampleRate::Hz88200 => 88200,
            SampleRate::Hz96000 => 96000,
        }
    }

    pub fn as_f64(self) -> f64 {
        self.as_u32() as f64
    }

    /// The other rates ordered by distance from `self`, nearest first.
    pub fn alternatives(self) -> impl Iterator<Item = SampleRate> {
        let mut others: Vec<SampleRate> = Self::ALL.into_iter().filter(|r| *r != self).collect();
        let hz = self.as_u32() as i64;
        others.sort_by_key(|r| (r.as_u32() as i64 - hz).abs());
        others.into_iter()
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        SampleRate::Hz44100
    }
}

impl TryFrom<u32> for SampleRate {
    type Error = Error;

    fn try_from(hz: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_u32() == hz)
            .ok_or_else(|| Error::InvalidConfig(format!("unsupported sample rate {hz} Hz")))
    }
}

impl From<SampleRate> for u32 {
    fn from(rate: SampleRate) -> u32 {
        rate.as_u32()
    }
}

/// Which directions a device session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DuplexMode {
    #[default]
    Full,
    Playback,
    Capture,
}

impl DuplexMode {
    /// Modes to try, in order, when `self` is rejected by a backend.
    pub fn downgrades(self) -> &'static [DuplexMode] {
        match self {
            DuplexMode::Full => &[DuplexMode::Playback, DuplexMode::Capture],
            DuplexMode::Playback | DuplexMode::Capture => &[],
        }
    }

    pub fn has_playback(self) -> bool {
        matches!(self, DuplexMode::Full | DuplexMode::Playback)
    }

    pub fn has_capture(self) -> bool {
        matches!(self, DuplexMode::Full | DuplexMode::Capture)
    }
}

/// Closed set of driver backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// ALSA host (Linux).
    Alsa,
    /// JACK host (requires the `jack` feature).
    Jack,
    /// Platform default host (CoreAudio, WASAPI, or ALSA).
    PortAudio,
    /// Simulated device clocked by a timer thread.
    Dummy,
    /// No I/O at all. Always opens.
    Null,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Alsa => "ALSA",
            BackendKind::Jack => "JACK",
            BackendKind::PortAudio => "PortAudio",
            BackendKind::Dummy => "Dummy Driver",
            BackendKind::Null => "Null Driver",
        }
    }
}

/// Parameters a backend is asked to open with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_id: String,
    pub sample_rate: SampleRate,
    /// Frames per period.
    pub period_size: usize,
    /// Periods in the hardware buffer (2 or 3).
    pub period_count: usize,
    pub duplex: DuplexMode,
    pub input_channels: usize,
    pub output_channels: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "default".into(),
            sample_rate: SampleRate::Hz44100,
            period_size: 512,
            period_count: 2,
            duplex: DuplexMode::Full,
            input_channels: 2,
            output_channels: 2,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if !(16..=8192).contains(&self.period_size) || !self.period_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "period_size {} must be a power of two in 16..=8192",
                self.period_size
            )));
        }
        if !(2..=3).contains(&self.period_count) {
            return Err(Error::InvalidConfig(format!(
                "period_count {} must be 2 or 3",
                self.period_count
            )));
        }
        if self.duplex.has_playback() && self.output_channels == 0 {
            return Err(Error::InvalidConfig(
                "playback requires at least one output channel".into(),
            ));
        }
        if self.duplex.has_capture() && self.input_channels == 0 {
            return Err(Error::InvalidConfig(
                "capture requires at least one input channel".into(),
            ));
        }
        Ok(())
    }

    /// Duration of one period.
    pub fn period_duration(&self) -> Duration {
        Duration::from_secs_f64(self.period_size as f64 / self.sample_rate.as_f64())
    }

    /// Hardware buffer latency: period size × period count / sample rate.
    pub fn buffer_latency(&self) -> Duration {
        Duration::from_secs_f64(
            (self.period_size * self.period_count) as f64 / self.sample_rate.as_f64(),
        )
    }

    pub fn buffer_latency_ms(&self) -> f64 {
        self.buffer_latency().as_secs_f64() * 1000.0
    }

    pub fn with_duplex(&self, duplex: DuplexMode) -> Self {
        Self {
            duplex,
            ..self.clone()
        }
    }

    pub fn with_sample_rate(&self, sample_rate: SampleRate) -> Self {
        Self {
            sample_rate,
            ..self.clone()
        }
    }
}

/// Stall and underrun-storm detection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// How often the watchdog samples the callback heartbeat.
    pub check_interval: Duration,
    /// No callbacks for this long means the driver is hung.
    pub stall_threshold: Duration,
    /// Underrun periods inside `storm_window` that count as a storm.
    pub storm_threshold: u32,
    pub storm_window: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(100),
            stall_threshold: Duration::from_secs(1),
            storm_threshold: 30,
            storm_window: Duration::from_secs(30),
        }
    }
}

impl WatchdogConfig {
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() || self.stall_threshold < self.check_interval {
            return Err(Error::InvalidConfig(
                "stall_threshold must be at least one non-zero check_interval".into(),
            ));
        }
        if self.storm_threshold == 0 || self.storm_window.is_zero() {
            return Err(Error::InvalidConfig(
                "storm detection needs a non-zero threshold and window".into(),
            ));
        }
        Ok(())
    }
}
