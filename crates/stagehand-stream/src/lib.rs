//! Disk streaming cache: per-source read-ahead rings for playback,
//! write-behind rings for capture, and the butler thread that services them.
//!
//! # Primary API
//!
//! - [`Butler`]: owns the disk I/O thread; opens sources and captures
//! - [`PlaybackConsumer`]: real-time read side of a playback ring, with seek
//! - [`CaptureProducer`]: real-time write side of a capture ring
//! - [`StreamConfig`]: ring sizing and water marks
//!
//! # Example
//!
//! ```ignore
//! use stagehand_stream::{Butler, StreamConfig};
//!
//! let butler = Butler::spawn(StreamConfig::default(), 48000, 256)?;
//! let mut source = butler.open_source("drums.wav")?;
//! source.seek(0);
//! // hand `source` to the audio thread; it reads silence until refilled
//! ```

mod butler;
mod capture;
mod config;
mod error;
mod metrics;
mod reader;
mod refill;
mod request;
mod ring;

pub use butler::Butler;
pub use config::StreamConfig;
pub use error::{Error, Result};
pub use metrics::{IOMetrics, IOMetricsSnapshot};
pub use reader::SourceReader;
pub use request::{ButlerState, CaptureId, SourceId};
pub use ring::{
    playback_ring, CaptureProducer, Frame, PlaybackConsumer, PlaybackProducer, ReadOutcome,
    SourceMonitor, SourceStatus,
};
