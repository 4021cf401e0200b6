//! Centralized error type for the stagehand umbrella crate.
//!
//! Wraps both subsystem errors so `?` propagates naturally across crate boundaries.

use crate::track::{ClipId, TrackId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] stagehand_core::Error),

    #[error(transparent)]
    Stream(#[from] stagehand_stream::Error),

    #[error("Unknown track {}", .0.0)]
    UnknownTrack(TrackId),

    #[error("Unknown clip {}", .0.0)]
    UnknownClip(ClipId),

    #[error("Track limit of {0} reached")]
    TrackLimit(usize),

    #[error("Clip limit of {0} per track reached")]
    ClipLimit(usize),

    #[error("Track {} is not armed", .0.0)]
    NotArmed(TrackId),

    /// The audio thread did not pick up a command in time.
    #[error("Command was not applied within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Engine has been shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;
