//! Messages between the control thread and the mixer.
//!
//! Anything a command carries (a new track, a clip with its stream, a capture
//! producer) is allocated before it is sent. Whatever the mixer lets go of
//! comes back as [`Retired`] so it is freed on the control thread.

use crate::track::{Clip, ClipId, Track, TrackId};
use stagehand_core::AckToken;
use stagehand_stream::CaptureProducer;

/// One deferred mutation, applied at the start of the next period.
pub enum Command {
    Play,
    Stop,
    /// Move the transport to a timeline frame and re-seek every clip.
    Seek(u64),
    SetGain {
        track: TrackId,
        gain: f32,
    },
    SetPan {
        track: TrackId,
        pan: f32,
    },
    SetMute {
        track: TrackId,
        muted: bool,
    },
    SetSolo {
        track: TrackId,
        soloed: bool,
    },
    /// Record `input_bus` into `capture` while the transport rolls.
    ArmTrack {
        track: TrackId,
        capture: Box<CaptureProducer>,
        input_bus: usize,
    },
    DisarmTrack {
        track: TrackId,
    },
    AddTrack(Box<Track>),
    RemoveTrack(TrackId),
    AddClip {
        track: TrackId,
        clip: Box<Clip>,
    },
    RemoveClip {
        track: TrackId,
        clip: ClipId,
    },
    SetClipGain {
        track: TrackId,
        clip: ClipId,
        gain: f32,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Play => "Play",
            Command::Stop => "Stop",
            Command::Seek(_) => "Seek",
            Command::SetGain { .. } => "SetGain",
            Command::SetPan { .. } => "SetPan",
            Command::SetMute { .. } => "SetMute",
            Command::SetSolo { .. } => "SetSolo",
            Command::ArmTrack { .. } => "ArmTrack",
            Command::DisarmTrack { .. } => "DisarmTrack",
            Command::AddTrack(_) => "AddTrack",
            Command::RemoveTrack(_) => "RemoveTrack",
            Command::AddClip { .. } => "AddClip",
            Command::RemoveClip { .. } => "RemoveClip",
            Command::SetClipGain { .. } => "SetClipGain",
        }
    }
}

/// A command plus the token the mixer acknowledges it with.
pub struct CommandEnvelope {
    pub command: Command,
    pub ack: Option<AckToken>,
}

impl CommandEnvelope {
    pub fn new(command: Command) -> Self {
        Self { command, ack: None }
    }

    pub fn with_ack(command: Command, ack: AckToken) -> Self {
        Self {
            command,
            ack: Some(ack),
        }
    }
}

impl From<Command> for CommandEnvelope {
    fn from(command: Command) -> Self {
        Self::new(command)
    }
}

/// Resources handed back by the mixer for release on the control thread.
pub enum Retired {
    Track(Box<Track>),
    Clip(Box<Clip>),
    Capture {
        track: TrackId,
        producer: Box<CaptureProducer>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_stays_small() {
        assert!(std::mem::size_of::<CommandEnvelope>() <= 48);
    }

    #[test]
    fn test_ack_attached() {
        let token = AckToken::generate();
        let env = CommandEnvelope::with_ack(Command::Seek(10), token);
        assert_eq!(env.ack, Some(token));
        assert_eq!(env.command.name(), "Seek");
        assert!(CommandEnvelope::from(Command::Play).ack.is_none());
    }
}
