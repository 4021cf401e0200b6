//! Status events posted from the audio side and the device manager.
//!
//! Every payload is `Copy` and fixed-size so events can be produced on the
//! real-time thread without allocating.

use crate::config::{BackendKind, DuplexMode, SampleRate};
use crate::error::DriverError;

/// Token attached to a command so the caller can observe when it was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckToken(pub u64);

impl AckToken {
    /// Generate a new unique token.
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifies the streamed source or capture an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTag(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Fatal,
}

/// Why the device manager moved to the Null backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FallbackReason {
    /// Every preferred backend failed to open.
    CreationFailed,
    /// The driver stopped invoking callbacks.
    Stalled,
    /// Too many underruns inside the storm window.
    UnderrunStorm,
    /// The backend reported the device as lost.
    DeviceLost,
    /// A streamed source stayed outside its water marks beyond tolerance.
    StreamFailure,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusEvent {
    /// A playback source could not supply a full period.
    Underrun { stream: StreamTag, frame: u64 },
    /// A capture ring could not accept a full period.
    Overrun { stream: StreamTag, frame: u64 },
    /// The driver stopped calling back.
    DriverStalled { backend: BackendKind },
    PositionUpdate { frame: u64 },
    /// Post-sum output exceeded full scale during this period.
    Clipped { frame: u64, peak: f32 },
    /// Playback ring occupancy dropped below the low-water mark.
    LowWater { stream: StreamTag },
    /// Capture ring occupancy rose above the high-water mark.
    HighWater { stream: StreamTag },
    /// Water-mark violations persisted beyond the tolerance window.
    StreamFailed { stream: StreamTag },
    DuplexDowngraded { from: DuplexMode, to: DuplexMode },
    RateRenegotiated {
        requested: SampleRate,
        actual: SampleRate,
    },
    DriverCreationFailed {
        backend: BackendKind,
        error: DriverError,
    },
    XrunStorm { count: u32 },
    SwitchedToNull { reason: FallbackReason },
    /// The Null backend itself stopped calling back. No further recovery.
    Unrecoverable,
    Acknowledged(AckToken),
    /// A command could not be applied (e.g. track limit reached).
    CommandRejected(AckToken),
}

impl StatusEvent {
    pub fn severity(&self) -> Severity {
        match self {
            StatusEvent::PositionUpdate { .. } | StatusEvent::Acknowledged(_) => Severity::Info,
            StatusEvent::Underrun { .. }
            | StatusEvent::Overrun { .. }
            | StatusEvent::Clipped { .. }
            | StatusEvent::LowWater { .. }
            | StatusEvent::HighWater { .. }
            | StatusEvent::DuplexDowngraded { .. }
            | StatusEvent::RateRenegotiated { .. }
            | StatusEvent::DriverCreationFailed { .. }
            | StatusEvent::CommandRejected(_) => Severity::Warning,
            StatusEvent::StreamFailed { .. } | StatusEvent::XrunStorm { .. } => Severity::Critical,
            StatusEvent::DriverStalled { .. }
            | StatusEvent::SwitchedToNull { .. }
            | StatusEvent::Unrecoverable => Severity::Fatal,
        }
    }

    /// Text suitable for a user-visible notification.
    pub fn describe(&self) -> String {
        match self {
            StatusEvent::Underrun { stream, frame } => {
                format!("Buffer underrun on stream {} at frame {frame}", stream.0)
            }
            StatusEvent::Overrun { stream, frame } => {
                format!("Capture overrun on stream {} at frame {frame}", stream.0)
            }
            StatusEvent::DriverStalled { backend } => {
                format!("{} stopped responding", backend.name())
            }
            StatusEvent::PositionUpdate { frame } => format!("Position {frame}"),
            StatusEvent::Clipped { frame, peak } => {
                format!("Output clipped at frame {frame} (peak {peak:.3})")
            }
            StatusEvent::LowWater { stream } => {
                format!("Stream {} is running low on buffered audio", stream.0)
            }
            StatusEvent::HighWater { stream } => {
                format!("Capture stream {} is not being written fast enough", stream.0)
            }
            StatusEvent::StreamFailed { stream } => {
                format!("Disk cannot keep up with stream {}", stream.0)
            }
            StatusEvent::DuplexDowngraded { from, to } => {
                format!("Duplex mode {from:?} unsupported, using {to:?}")
            }
            StatusEvent::RateRenegotiated { requested, actual } => format!(
                "Sample rate {} Hz unsupported, using {} Hz",
                requested.as_u32(),
                actual.as_u32()
            ),
            StatusEvent::DriverCreationFailed { backend, error } => {
                format!("Could not open {}: {error}", backend.name())
            }
            StatusEvent::XrunStorm { count } => {
                format!("Buffer underrun storm detected ({count} underruns)")
            }
            StatusEvent::SwitchedToNull { reason } => match reason {
                FallbackReason::CreationFailed => {
                    "No audio driver could be opened, switching to Null Driver".into()
                }
                FallbackReason::Stalled => {
                    "Audio thread stalled, switching to Null Driver".into()
                }
                FallbackReason::UnderrunStorm => {
                    "Buffer underrun storm detected, switching to Null Driver".into()
                }
                FallbackReason::DeviceLost => {
                    "Audio device disappeared, switching to Null Driver".into()
                }
                FallbackReason::StreamFailure => {
                    "Disk cannot keep up, switching to Null Driver".into()
                }
            },
            StatusEvent::Unrecoverable => {
                "The Null Driver stopped processing audio, the audio engine cannot recover".into()
            }
            StatusEvent::Acknowledged(token) => format!("Command {} applied", token.0),
            StatusEvent::CommandRejected(token) => format!("Command {} rejected", token.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_is_fatal() {
        let ev = StatusEvent::SwitchedToNull {
            reason: FallbackReason::UnderrunStorm,
        };
        assert_eq!(ev.severity(), Severity::Fatal);
        assert_eq!(
            ev.describe(),
            "Buffer underrun storm detected, switching to Null Driver"
        );
    }

    #[test]
    fn test_underrun_is_warning() {
        let ev = StatusEvent::Underrun {
            stream: StreamTag(3),
            frame: 1024,
        };
        assert_eq!(ev.severity(), Severity::Warning);
        assert!(Severity::Warning < Severity::Fatal);
    }

    #[test]
    fn test_event_is_small() {
        assert!(std::mem::size_of::<StatusEvent>() <= 32);
    }

    #[test]
    fn test_ack_tokens_unique() {
        assert_ne!(AckToken::generate(), AckToken::generate());
    }
}
