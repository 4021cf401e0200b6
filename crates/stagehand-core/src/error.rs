//! Error types for stagehand-core.

use thiserror::Error;

/// Failure opening or running a driver backend.
///
/// Fixed-size and `Copy` so it can travel inside a [`StatusEvent`](crate::StatusEvent).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("device busy")]
    DeviceBusy,

    #[error("device not found")]
    DeviceNotFound,

    #[error("unsupported configuration")]
    UnsupportedConfig,

    #[error("unknown driver error")]
    Unknown,
}

/// Error type for stagehand-core operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Driver: {0}")]
    Driver(#[from] DriverError),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Command queue full")]
    QueueFull,

    #[error("No device session is open")]
    NoSession,

    #[error("Audio engine failed unrecoverably")]
    Unrecoverable,

    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
