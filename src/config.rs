//! Aggregate engine configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use stagehand_core::{available_backends, BackendKind, DeviceConfig, WatchdogConfig};
use stagehand_stream::StreamConfig;
use std::time::Duration;

/// Everything needed to bring up an [`Engine`](crate::Engine).
///
/// Serializable so the settings UI and project files can round-trip it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub device: DeviceConfig,
    pub watchdog: WatchdogConfig,
    pub stream: StreamConfig,
    /// Backends to try in order. Null is always tried last.
    pub preferences: Vec<BackendKind>,
    /// Control to audio command slots (default: 256)
    pub command_capacity: usize,
    /// Audio to control status event slots (default: 1024)
    pub status_capacity: usize,
    /// Tracks the mixer reserves room for (default: 64)
    pub max_tracks: usize,
    /// Clips per track the mixer reserves room for (default: 32)
    pub max_clips_per_track: usize,
    /// How long blocking control operations wait for the audio thread (default: 2 s)
    pub command_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            watchdog: WatchdogConfig::default(),
            stream: StreamConfig::default(),
            preferences: available_backends(),
            command_capacity: 256,
            status_capacity: 1024,
            max_tracks: 64,
            max_clips_per_track: 32,
            command_timeout: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.device.validate()?;
        self.watchdog.validate()?;
        self.stream.validate()?;
        if self.command_capacity == 0 || self.status_capacity == 0 {
            return Err(invalid("relay capacities must be non-zero"));
        }
        if self.max_tracks == 0 || self.max_clips_per_track == 0 {
            return Err(invalid("track and clip limits must be non-zero"));
        }
        if self.command_timeout.is_zero() {
            return Err(invalid("command_timeout must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> Error {
    stagehand_core::Error::InvalidConfig(msg.into()).into()
}
