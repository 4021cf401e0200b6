//! Error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Invalid stream configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// The butler thread is gone or did not answer.
    #[error("Butler error: {0}")]
    Butler(String),
}

pub type Result<T> = std::result::Result<T, Error>;
