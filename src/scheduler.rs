//! Transport/mix scheduler: the real-time entry point invoked once per period.
//!
//! Each period, in order:
//! 1. drain the command relay, applying every pending mutation
//! 2. pull each active clip's frames from its playback ring and push
//!    record-armed inputs into their capture rings
//! 3. apply clip fades and gain, then track gain and pan
//! 4. sum audible tracks into the master bus (mute/solo)
//! 5. advance the transport by one period
//! 6. post `PositionUpdate`
//!
//! After a seek or play the transport holds (silent, not advancing) until
//! the clips under the playhead have refilled, so every clip starts in sync.
//! A clip still refilling after `tolerance_periods` under the playhead is
//! starving and is reported like any other underrun.
//!
//! Nothing here blocks, locks or allocates. Storage for tracks, clips and mix
//! buses is reserved when the scheduler is built.

use crate::command::{Command, CommandEnvelope, Retired};
use crate::config::EngineConfig;
use crate::track::{balance, Armed, Clip, StreamWatch, Track, TrackId, WatchVerdict};
use crate::transport::{OutputMeter, TransportReader, TransportShared};
use stagehand_core::relay::{self, status_channel, RelayReceiver, RelaySender};
use stagehand_core::{PeriodBuffer, PeriodCallback, PeriodIo, StatusEvent, StatusSender, StreamTag, XrunMonitor};
use stagehand_stream::ReadOutcome;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Largest period the mix buses are sized for.
pub const MAX_PERIOD_FRAMES: usize = 8192;

#[derive(Debug, Clone, Copy)]
struct WaterMarks {
    low: f32,
    high: f32,
    tolerance: u32,
}

/// Control-thread ends of the scheduler's queues and shared state.
pub struct SchedulerHandle {
    pub commands: RelaySender<CommandEnvelope>,
    pub status: RelayReceiver<StatusEvent>,
    pub retired: RelayReceiver<Retired>,
    pub transport: TransportReader,
    pub meter: Arc<OutputMeter>,
    /// Status events lost because `status` was not drained.
    pub dropped_events: Arc<AtomicU64>,
}

pub struct MixScheduler {
    commands: RelayReceiver<CommandEnvelope>,
    status: StatusSender,
    retired: RelaySender<Retired>,
    tracks: Vec<Box<Track>>,
    max_tracks: usize,
    max_clips: usize,
    position: u64,
    rolling: bool,
    /// Periods spent holding the transport after a locate.
    locating: Option<u32>,
    transport: Arc<TransportShared>,
    meter: Arc<OutputMeter>,
    xruns: Arc<XrunMonitor>,
    marks: WaterMarks,
    mix_l: Vec<f32>,
    mix_r: Vec<f32>,
    bus_l: Vec<f32>,
    bus_r: Vec<f32>,
    clip_l: Vec<f32>,
    clip_r: Vec<f32>,
}

impl MixScheduler {
    /// Build a scheduler and the handle the control thread drives it with.
    /// Underruns and stream failures are reported to `xruns`.
    pub fn new(config: &EngineConfig, xruns: Arc<XrunMonitor>) -> (Self, SchedulerHandle) {
        let (command_tx, command_rx) = relay::channel(config.command_capacity);
        let (status_tx, status_rx) = status_channel(config.status_capacity);
        // Every command retires at most one item and the control side drains
        // before each send, so twice the command depth cannot fill up.
        let (retired_tx, retired_rx) = relay::channel(config.command_capacity * 2);
        let transport = Arc::new(TransportShared::default());
        let meter = OutputMeter::new();
        let dropped_events = status_tx.dropped_counter();

        let scheduler = Self {
            commands: command_rx,
            status: status_tx,
            retired: retired_tx,
            tracks: Vec::with_capacity(config.max_tracks),
            max_tracks: config.max_tracks,
            max_clips: config.max_clips_per_track,
            position: 0,
            rolling: false,
            locating: None,
            transport: Arc::clone(&transport),
            meter: Arc::clone(&meter),
            xruns,
            marks: WaterMarks {
                low: config.stream.low_water,
                high: config.stream.high_water,
                tolerance: config.stream.tolerance_periods,
            },
            mix_l: vec![0.0; MAX_PERIOD_FRAMES],
            mix_r: vec![0.0; MAX_PERIOD_FRAMES],
            bus_l: vec![0.0; MAX_PERIOD_FRAMES],
            bus_r: vec![0.0; MAX_PERIOD_FRAMES],
            clip_l: vec![0.0; MAX_PERIOD_FRAMES],
            clip_r: vec![0.0; MAX_PERIOD_FRAMES],
        };
        let handle = SchedulerHandle {
            commands: command_tx,
            status: status_rx,
            retired: retired_rx,
            transport: TransportReader::new(transport),
            meter,
            dropped_events,
        };
        (scheduler, handle)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_rolling(&self) -> bool {
        self.rolling
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn drain_commands(&mut self) {
        while let Some(envelope) = self.commands.try_recv() {
            let applied = self.apply(envelope.command);
            if let Some(token) = envelope.ack {
                self.status.post(if applied {
                    StatusEvent::Acknowledged(token)
                } else {
                    StatusEvent::CommandRejected(token)
                });
            }
        }
    }

    /// After a locate, hold the transport until the clips under the playhead
    /// have refilled, for at most `tolerance` periods.
    fn hold_for_locate(&mut self, frames: usize) -> bool {
        let Some(waited) = self.locating else {
            return false;
        };
        let (start, end) = (self.position, self.position + frames as u64);
        let pending = self
            .tracks
            .iter()
            .flat_map(|t| t.clips.iter())
            .any(|c| c.start < end && c.end() > start && c.source.is_refilling());
        if pending && waited < self.marks.tolerance {
            self.locating = Some(waited + 1);
            for clip in self.tracks.iter_mut().flat_map(|t| t.clips.iter_mut()) {
                if clip.start < end && clip.end() > start && clip.source.is_refilling() {
                    clip.refill_wait = clip.refill_wait.saturating_add(1);
                }
            }
            true
        } else {
            self.locating = None;
            false
        }
    }

    fn track_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == id).map(|t| &mut **t)
    }

    fn update_track(&mut self, id: TrackId, f: impl FnOnce(&mut Track)) -> bool {
        match self.track_mut(id) {
            Some(track) => {
                f(track);
                true
            }
            None => false,
        }
    }

    fn retire(&mut self, item: Retired) {
        if let Err(full) = self.retired.try_send(item) {
            // Only reachable if the control side stopped draining.
            drop(full.into_inner());
        }
    }

    /// Returns false when the command could not be applied.
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::Play => {
                if !self.rolling {
                    self.rolling = true;
                    self.locating = Some(0);
                }
                true
            }
            Command::Stop => {
                self.rolling = false;
                self.status.post(StatusEvent::PositionUpdate {
                    frame: self.position,
                });
                true
            }
            Command::Seek(frame) => {
                self.position = frame;
                self.locating = Some(0);
                for track in self.tracks.iter_mut() {
                    for clip in track.clips.iter_mut() {
                        clip.seek_to(frame);
                    }
                }
                self.status.post(StatusEvent::PositionUpdate { frame });
                true
            }
            Command::SetGain { track, gain } => self.update_track(track, |t| t.gain = gain),
            Command::SetPan { track, pan } => {
                self.update_track(track, |t| t.pan = pan.clamp(-1.0, 1.0))
            }
            Command::SetMute { track, muted } => self.update_track(track, |t| t.mute = muted),
            Command::SetSolo { track, soloed } => self.update_track(track, |t| t.solo = soloed),
            Command::ArmTrack {
                track,
                capture,
                input_bus,
            } => match self.track_mut(track) {
                Some(t) => {
                    let previous = t.armed.replace(Armed {
                        producer: capture,
                        input_bus,
                        watch: StreamWatch::default(),
                    });
                    if let Some(previous) = previous {
                        self.retire(Retired::Capture {
                            track,
                            producer: previous.producer,
                        });
                    }
                    true
                }
                None => {
                    self.retire(Retired::Capture {
                        track,
                        producer: capture,
                    });
                    false
                }
            },
            Command::DisarmTrack { track } => {
                match self.track_mut(track).and_then(Track::take_capture) {
                    Some(producer) => {
                        self.retire(Retired::Capture { track, producer });
                        true
                    }
                    None => false,
                }
            }
            Command::AddTrack(track) => {
                let duplicate = self.tracks.iter().any(|t| t.id == track.id);
                if duplicate || self.tracks.len() >= self.max_tracks {
                    self.retire(Retired::Track(track));
                    false
                } else {
                    self.tracks.push(track);
                    true
                }
            }
            Command::RemoveTrack(id) => match self.tracks.iter().position(|t| t.id == id) {
                Some(index) => {
                    let track = self.tracks.remove(index);
                    self.retire(Retired::Track(track));
                    true
                }
                None => false,
            },
            Command::AddClip { track, mut clip } => {
                let position = self.position;
                let max_clips = self.max_clips;
                let rejected = match self.track_mut(track) {
                    Some(t) if t.clips.len() < max_clips.min(t.clips.capacity()) => {
                        clip.seek_to(position);
                        t.clips.push(clip);
                        None
                    }
                    _ => Some(clip),
                };
                match rejected {
                    Some(clip) => {
                        self.retire(Retired::Clip(clip));
                        false
                    }
                    None => true,
                }
            }
            Command::RemoveClip { track, clip } => {
                let removed = self.track_mut(track).and_then(|t| {
                    let index = t.clips.iter().position(|c| c.id == clip)?;
                    Some(t.clips.remove(index))
                });
                match removed {
                    Some(clip) => {
                        self.retire(Retired::Clip(clip));
                        true
                    }
                    None => false,
                }
            }
            Command::SetClipGain { track, clip, gain } => self
                .track_mut(track)
                .and_then(|t| t.clip_mut(clip))
                .map(|c| c.gain = gain)
                .is_some(),
        }
    }
}

/// Mix one clip's share of the period into the track bus. Returns true when
/// the clip's ring came up short.
#[allow(clippy::too_many_arguments)]
#[inline]
fn render_clip(
    clip: &mut Clip,
    position: u64,
    frames: usize,
    bus: (&mut [f32], &mut [f32]),
    scratch: (&mut [f32], &mut [f32]),
    status: &mut StatusSender,
    xruns: &XrunMonitor,
    marks: WaterMarks,
) -> bool {
    let end = position + frames as u64;
    let clip_end = clip.end();
    if clip_end <= position || clip.start >= end {
        return false;
    }
    let a = (clip.start.max(position) - position) as usize;
    let b = (clip_end.min(end) - position) as usize;
    let (scratch_l, scratch_r) = scratch;

    let tag: StreamTag = clip.source.id().into();
    let mut underran = false;
    let mut starving = false;
    match clip.source.read(&mut scratch_l[a..b], &mut scratch_r[a..b]) {
        ReadOutcome::Refilling => {
            clip.refill_wait = clip.refill_wait.saturating_add(1);
            if clip.refill_wait <= marks.tolerance {
                return false;
            }
            starving = true;
        }
        ReadOutcome::Underrun { .. } => underran = true,
        ReadOutcome::Complete => clip.refill_wait = 0,
    }
    if underran || starving {
        status.post(StatusEvent::Underrun {
            stream: tag,
            frame: position,
        });
    }

    match clip
        .watch
        .observe(starving || clip.source.fill() < marks.low, marks.tolerance)
    {
        WatchVerdict::Entered => status.post(StatusEvent::LowWater { stream: tag }),
        WatchVerdict::Failed => {
            status.post(StatusEvent::StreamFailed { stream: tag });
            xruns.report_stream_failure();
        }
        WatchVerdict::Quiet => {}
    }
    if starving {
        return true;
    }

    let (bus_l, bus_r) = bus;
    for i in a..b {
        let g = clip.envelope(position + i as u64 - clip.start);
        bus_l[i] += scratch_l[i] * g;
        bus_r[i] += scratch_r[i] * g;
    }
    underran
}

/// Push the armed input bus into its capture ring. Returns true on overrun.
#[inline]
fn capture_input(
    armed: &mut Armed,
    input: &PeriodBuffer<'_>,
    position: u64,
    zeros: &[f32],
    status: &mut StatusSender,
    xruns: &XrunMonitor,
    marks: WaterMarks,
) -> bool {
    let channels = input.channels();
    let left_ch = armed.input_bus * 2;
    let (left, right) = if left_ch < channels {
        let left = input.channel(left_ch);
        let right = if left_ch + 1 < channels {
            input.channel(left_ch + 1)
        } else {
            left
        };
        (left, right)
    } else {
        // Bus not present in this duplex mode: record silence.
        (zeros, zeros)
    };

    let tag: StreamTag = armed.producer.id().into();
    let offered = left.len().min(right.len());
    let pushed = armed.producer.push(left, right);
    let overran = pushed < offered;
    if overran {
        status.post(StatusEvent::Overrun {
            stream: tag,
            frame: position,
        });
    }

    match armed
        .watch
        .observe(armed.producer.fill() > marks.high, marks.tolerance)
    {
        WatchVerdict::Entered => status.post(StatusEvent::HighWater { stream: tag }),
        WatchVerdict::Failed => {
            status.post(StatusEvent::StreamFailed { stream: tag });
            xruns.report_stream_failure();
        }
        WatchVerdict::Quiet => {}
    }
    overran
}

impl PeriodCallback for MixScheduler {
    fn process(&mut self, io: &mut PeriodIo<'_>) {
        self.drain_commands();

        let frames = io.frames.min(MAX_PERIOD_FRAMES);
        let position = self.position;
        let rolling = self.rolling && !self.hold_for_locate(frames);
        let any_solo = self.tracks.iter().any(|t| t.solo);
        let Self {
            tracks,
            status,
            xruns,
            marks,
            mix_l,
            mix_r,
            bus_l,
            bus_r,
            clip_l,
            clip_r,
            meter,
            ..
        } = &mut *self;
        let marks = *marks;

        mix_l[..frames].fill(0.0);
        mix_r[..frames].fill(0.0);
        let mut xrun = false;

        for track in tracks.iter_mut() {
            bus_l[..frames].fill(0.0);
            bus_r[..frames].fill(0.0);

            if rolling {
                for clip in track.clips.iter_mut() {
                    xrun |= render_clip(
                        clip,
                        position,
                        frames,
                        (&mut bus_l[..frames], &mut bus_r[..frames]),
                        (&mut clip_l[..frames], &mut clip_r[..frames]),
                        status,
                        xruns,
                        marks,
                    );
                }
                if let Some(armed) = track.armed.as_mut() {
                    clip_l[..frames].fill(0.0);
                    xrun |= capture_input(
                        armed,
                        &io.input,
                        position,
                        &clip_l[..frames.min(io.input.frames())],
                        status,
                        xruns,
                        marks,
                    );
                }
            }

            if track.audible(any_solo) {
                let (pan_l, pan_r) = balance(track.pan);
                let (gain_l, gain_r) = (track.gain * pan_l, track.gain * pan_r);
                for i in 0..frames {
                    mix_l[i] += bus_l[i] * gain_l;
                    mix_r[i] += bus_r[i] * gain_r;
                }
            }
        }

        // A device xrun in the same period was already counted by the monitor.
        if xrun && !io.hardware_xrun {
            xruns.report_underrun();
        }

        let peak = mix_l[..frames]
            .iter()
            .chain(mix_r[..frames].iter())
            .fold(0.0f32, |p, s| p.max(s.abs()));
        meter.record(peak);
        if peak > 1.0 {
            status.post(StatusEvent::Clipped {
                frame: position,
                peak,
            });
        }

        io.output.silence();
        let n = frames.min(io.output.frames());
        match io.output.channels() {
            0 => {}
            1 => {
                for (i, out) in io.output.channel_mut(0)[..n].iter_mut().enumerate() {
                    *out = 0.5 * (mix_l[i] + mix_r[i]);
                }
            }
            _ => {
                io.output.channel_mut(0)[..n].copy_from_slice(&mix_l[..n]);
                io.output.channel_mut(1)[..n].copy_from_slice(&mix_r[..n]);
            }
        }

        if rolling {
            self.position += frames as u64;
            self.status.post(StatusEvent::PositionUpdate {
                frame: self.position,
            });
        }
        self.transport.publish(self.position, self.rolling);
    }
}
