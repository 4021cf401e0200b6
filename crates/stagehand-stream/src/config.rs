//! Disk streaming configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Ring sizing, water marks and butler I/O parameters.
///
/// Read at source-open time only. Changing it means reopening the project's
/// streamed sources.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Seconds of audio each playback and capture ring holds (default: 1.0)
    pub read_buffer_seconds: f64,
    /// Base disk read size in frames, scaled by varifill (default: 8192)
    pub chunk_frames: usize,
    /// Captured frames that trigger a flush to disk (default: 8192)
    pub flush_threshold: usize,
    /// Refill a playback ring once its fill drops below this fraction (default: 0.75)
    pub refill_threshold: f32,
    /// Playback fill below this fraction is a low-water violation (default: 0.1)
    pub low_water: f32,
    /// Capture fill above this fraction is a high-water violation (default: 0.9)
    pub high_water: f32,
    /// Consecutive violating periods before a stream is declared failed (default: 64)
    pub tolerance_periods: u32,
    /// Refill three or more sources concurrently with rayon (default: true)
    pub parallel_io: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_buffer_seconds: 1.0,
            chunk_frames: 8192,
            flush_threshold: 8192,
            refill_threshold: 0.75,
            low_water: 0.1,
            high_water: 0.9,
            tolerance_periods: 64,
            parallel_io: true,
        }
    }
}

impl StreamConfig {
    pub const RECOMMENDED_SECONDS: std::ops::RangeInclusive<f64> = 0.5..=2.0;
    pub const ACCEPTED_SECONDS: std::ops::RangeInclusive<f64> = 0.1..=10.0;

    pub fn with_read_buffer_seconds(seconds: f64) -> Self {
        Self {
            read_buffer_seconds: seconds,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !Self::ACCEPTED_SECONDS.contains(&self.read_buffer_seconds) {
            return Err(Error::InvalidConfig(format!(
                "read_buffer_seconds {} outside 0.1..=10.0",
                self.read_buffer_seconds
            )));
        }
        if !Self::RECOMMENDED_SECONDS.contains(&self.read_buffer_seconds) {
            tracing::warn!(
                "read buffer of {:.2} s is outside the recommended 0.5-2.0 s",
                self.read_buffer_seconds
            );
        }
        if self.chunk_frames == 0 || self.flush_threshold == 0 {
            return Err(Error::InvalidConfig(
                "chunk_frames and flush_threshold must be non-zero".into(),
            ));
        }
        if !(self.low_water > 0.0 && self.low_water < self.high_water && self.high_water < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "water marks must satisfy 0 < low ({}) < high ({}) < 1",
                self.low_water, self.high_water
            )));
        }
        if !(self.refill_threshold > 0.0 && self.refill_threshold <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "refill_threshold {} outside (0, 1]",
                self.refill_threshold
            )));
        }
        if self.tolerance_periods == 0 {
            return Err(Error::InvalidConfig("tolerance_periods must be non-zero".into()));
        }
        Ok(())
    }

    /// Ring capacity in frames for a given sample rate.
    pub fn ring_frames(&self, sample_rate: u32) -> usize {
        ((self.read_buffer_seconds * sample_rate as f64).ceil() as usize).max(1024)
    }
}
