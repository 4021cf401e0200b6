//! Track and clip render state.
//!
//! Built on the control thread, then moved into the mixer through the command
//! relay. Clip and track storage is reserved up front so nothing grows once
//! the mixer owns it.

use serde::{Deserialize, Serialize};
use stagehand_stream::{CaptureProducer, PlaybackConsumer};
use std::f32::consts::FRAC_PI_2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl TrackId {
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClipId(pub u64);

impl ClipId {
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Fade shape, evaluated over normalised progress `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FadeCurve {
    #[default]
    Linear,
    /// Quarter sine; constant power across a crossfade.
    EqualPower,
    /// Slow start, fast finish.
    Exponential,
}

impl FadeCurve {
    #[inline]
    pub fn gain(self, progress: f32) -> f32 {
        let t = progress.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => t,
            FadeCurve::EqualPower => (t * FRAC_PI_2).sin(),
            FadeCurve::Exponential => t * t,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Fade {
    /// Length in frames. Zero disables the fade.
    pub frames: u64,
    pub curve: FadeCurve,
}

impl Fade {
    pub fn new(frames: u64, curve: FadeCurve) -> Self {
        Self { frames, curve }
    }
}

/// Placement of a clip on the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipSpec {
    /// Timeline frame where the clip starts.
    pub start: u64,
    /// First source frame played.
    pub offset: u64,
    /// Frames played. `None` plays to the end of the source.
    pub length: Option<u64>,
    pub gain: f32,
    pub fade_in: Fade,
    pub fade_out: Fade,
}

impl Default for ClipSpec {
    fn default() -> Self {
        Self {
            start: 0,
            offset: 0,
            length: None,
            gain: 1.0,
            fade_in: Fade::default(),
            fade_out: Fade::default(),
        }
    }
}

impl ClipSpec {
    pub fn at(start: u64) -> Self {
        Self {
            start,
            ..Default::default()
        }
    }
}

/// Consecutive-period tracker for a stream's water mark.
#[derive(Debug, Default)]
pub(crate) struct StreamWatch {
    flagged: bool,
    periods: u32,
    failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchVerdict {
    Quiet,
    /// First violating period after a healthy one.
    Entered,
    /// Violations outlasted the tolerance window. Reported once.
    Failed,
}

impl StreamWatch {
    #[inline]
    pub(crate) fn observe(&mut self, violating: bool, tolerance: u32) -> WatchVerdict {
        if !violating {
            self.flagged = false;
            self.periods = 0;
            return WatchVerdict::Quiet;
        }
        self.periods = self.periods.saturating_add(1);
        if !self.flagged {
            self.flagged = true;
            return WatchVerdict::Entered;
        }
        if self.periods > tolerance && !self.failed {
            self.failed = true;
            return WatchVerdict::Failed;
        }
        WatchVerdict::Quiet
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A region of a streamed source placed on a track.
pub struct Clip {
    pub(crate) id: ClipId,
    pub(crate) start: u64,
    pub(crate) length: u64,
    pub(crate) offset: u64,
    pub(crate) gain: f32,
    pub(crate) fade_in: Fade,
    pub(crate) fade_out: Fade,
    pub(crate) source: PlaybackConsumer,
    pub(crate) watch: StreamWatch,
    /// Periods spent under the playhead waiting for the current seek.
    pub(crate) refill_wait: u32,
}

impl Clip {
    /// Wrap an opened source. Without an explicit length the clip never ends.
    pub fn new(source: PlaybackConsumer, spec: ClipSpec) -> Self {
        Self {
            id: ClipId::generate(),
            start: spec.start,
            length: spec.length.unwrap_or(u64::MAX),
            offset: spec.offset,
            gain: spec.gain,
            fade_in: spec.fade_in,
            fade_out: spec.fade_out,
            source,
            watch: StreamWatch::default(),
            refill_wait: 0,
        }
    }

    pub fn id(&self) -> ClipId {
        self.id
    }

    pub fn source(&self) -> &PlaybackConsumer {
        &self.source
    }

    pub(crate) fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    /// Point the source at the frame that plays at timeline `position`.
    pub(crate) fn seek_to(&mut self, position: u64) {
        let into = position.saturating_sub(self.start).min(self.length);
        self.source.seek(self.offset.saturating_add(into));
        self.watch.reset();
        self.refill_wait = 0;
    }

    /// Clip gain times both fades at `frame` frames into the clip.
    #[inline]
    pub(crate) fn envelope(&self, frame: u64) -> f32 {
        let mut g = self.gain;
        if frame < self.fade_in.frames {
            g *= self
                .fade_in
                .curve
                .gain(frame as f32 / self.fade_in.frames as f32);
        }
        let remaining = self.length.saturating_sub(frame);
        if remaining < self.fade_out.frames {
            g *= self
                .fade_out
                .curve
                .gain(remaining as f32 / self.fade_out.frames as f32);
        }
        g
    }
}

/// Record-arm state: where input comes from and where it goes.
pub(crate) struct Armed {
    pub producer: Box<CaptureProducer>,
    /// Stereo input bus index; channels `2 * bus` and `2 * bus + 1`.
    pub input_bus: usize,
    pub watch: StreamWatch,
}

/// Balance pan: unity at centre, the far side attenuated linearly.
#[inline]
pub fn balance(pan: f32) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    ((1.0 - pan).min(1.0), (1.0 + pan).min(1.0))
}

pub struct Track {
    pub(crate) id: TrackId,
    pub(crate) gain: f32,
    pub(crate) pan: f32,
    pub(crate) mute: bool,
    pub(crate) solo: bool,
    pub(crate) clips: Vec<Box<Clip>>,
    pub(crate) armed: Option<Armed>,
}

impl Track {
    /// New unity-gain, centred track with room for `max_clips` clips.
    pub fn new(max_clips: usize) -> Self {
        Self {
            id: TrackId::generate(),
            gain: 1.0,
            pan: 0.0,
            mute: false,
            solo: false,
            clips: Vec::with_capacity(max_clips),
            armed: None,
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_pan(mut self, pan: f32) -> Self {
        self.pan = pan.clamp(-1.0, 1.0);
        self
    }

    pub fn clip_count(&self) -> usize {
        self.clips.len()
    }

    pub(crate) fn clip_mut(&mut self, id: ClipId) -> Option<&mut Clip> {
        self.clips.iter_mut().find(|c| c.id == id).map(|c| &mut **c)
    }

    /// Detach the capture producer, if armed.
    pub(crate) fn take_capture(&mut self) -> Option<Box<CaptureProducer>> {
        self.armed.take().map(|a| a.producer)
    }

    /// Whether this track reaches the master bus.
    #[inline]
    pub(crate) fn audible(&self, any_solo: bool) -> bool {
        !self.mute && (!any_solo || self.solo)
    }
}
