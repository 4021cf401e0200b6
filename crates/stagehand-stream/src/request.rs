//! Identifiers and butler commands.

use crate::reader::SourceReader;
use crate::ring::{CaptureConsumer, PlaybackProducer};
use crossbeam_channel::Sender;
use stagehand_core::StreamTag;
use std::path::PathBuf;

/// Unique identifier for a streamed playback source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u64);

impl SourceId {
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Unique identifier for a capture stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureId(pub u64);

impl CaptureId {
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        // Offset so capture tags never collide with source tags in events.
        static COUNTER: AtomicU64 = AtomicU64::new(1 << 32);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl From<SourceId> for StreamTag {
    fn from(id: SourceId) -> Self {
        StreamTag(id.0)
    }
}

impl From<CaptureId> for StreamTag {
    fn from(id: CaptureId) -> Self {
        StreamTag(id.0)
    }
}

/// Butler transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ButlerState {
    #[default]
    Running,
    Paused,
    Stopped,
}

impl ButlerState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ButlerState::Running,
            1 => ButlerState::Paused,
            _ => ButlerState::Stopped,
        }
    }
}

/// Command sent to the butler thread.
pub(crate) enum ButlerCommand {
    /// Resume refill and flush work.
    Run,
    /// Suspend disk work (commands are still processed).
    Pause,
    /// Flush every capture to disk, then signal.
    WaitForCompletion(Sender<()>),

    OpenSource {
        id: SourceId,
        reader: Box<SourceReader>,
        producer: PlaybackProducer,
    },
    CloseSource(SourceId),

    RegisterCapture {
        id: CaptureId,
        consumer: CaptureConsumer,
        path: PathBuf,
        sample_rate: u32,
        channels: u16,
    },
    /// Flush the remainder, finalise the file and reply with frames written.
    FinishCapture {
        id: CaptureId,
        reply: Sender<crate::Result<u64>>,
    },

    Shutdown,
}
