//! # Stagehand - real-time audio I/O and disk streaming
//!
//! Moves audio between disk, memory and a sound card under hard timing
//! constraints while staying controllable from a non-real-time thread.
//!
//! ## Architecture
//!
//! Stagehand is an umbrella crate that coordinates:
//! - **stagehand-core** - driver backends, buffer pool, command relay, device
//!   manager with stall watchdog and Null fallback
//! - **stagehand-stream** - per-source playback and capture rings serviced by
//!   the butler (disk I/O) thread
//!
//! On top of those it provides the mix scheduler (the per-period entry point)
//! and the [`Engine`] facade.
//!
//! ## Quick Start
//!
//! ```ignore
//! use stagehand::prelude::*;
//!
//! let engine = Engine::builder()
//!     .preferences(vec![BackendKind::Jack, BackendKind::Alsa])
//!     .build()?;
//!
//! let drums = engine.add_track()?;
//! engine.add_clip(drums, "drums.wav", ClipSpec::at(0))?;
//! engine.play()?;
//!
//! for event in engine.poll() {
//!     println!("{}", event.describe());
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `hardware` (default) - ALSA and the platform default host via CPAL
//! - `jack` - JACK host via CPAL

/// Re-export of stagehand-core for direct access
pub use stagehand_core as core;

/// Re-export of stagehand-stream for direct access
pub use stagehand_stream as stream;

mod command;
mod config;
mod engine;
mod error;
mod scheduler;
mod track;
mod transport;

pub use command::{Command, CommandEnvelope, Retired};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};
pub use scheduler::{MixScheduler, SchedulerHandle, MAX_PERIOD_FRAMES};
pub use track::{balance, Clip, ClipId, ClipSpec, Fade, FadeCurve, Track, TrackId};
pub use transport::{OutputMeter, TransportReader};

// Core types
pub use stagehand_core::{
    AckToken, BackendKind, DeviceConfig, DeviceSession, DeviceState, DuplexMode,
    FallbackReason, SampleRate, Severity, StatusEvent, StreamTag, WatchdogConfig,
};

// Streaming types
pub use stagehand_stream::{SourceStatus, StreamConfig};

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::{
        BackendKind, ClipSpec, DeviceConfig, DeviceState, DuplexMode, Engine, EngineConfig,
        Fade, FadeCurve, SampleRate, Severity, StatusEvent, StreamConfig, WatchdogConfig,
    };
}
