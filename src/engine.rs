//! Engine facade: wires the command relay, butler, mix scheduler and device
//! manager together and exposes them to the control thread.

use crate::command::{Command, CommandEnvelope, Retired};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::scheduler::{MixScheduler, SchedulerHandle};
use crate::track::{Clip, ClipId, ClipSpec, Track, TrackId};
use crate::transport::{OutputMeter, TransportReader};
use parking_lot::Mutex;
use stagehand_core::relay::{RelayReceiver, RelaySender};
use stagehand_core::{
    AckToken, BackendKind, ClockControl, CpuMetrics, DeviceConfig, DeviceManager,
    DeviceSession, DeviceState, DummyBehavior, Severity, StatusEvent, WatchdogConfig,
    XrunMonitor,
};
use stagehand_stream::{
    Butler, CaptureId, CaptureProducer, IOMetricsSnapshot, SourceId, SourceReader,
    SourceStatus, StreamConfig,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Builder for [`Engine`].
///
/// # Example
///
/// ```ignore
/// use stagehand::prelude::*;
///
/// let engine = Engine::builder()
///     .preferences(vec![BackendKind::Alsa])
///     .build()?;
///
/// let track = engine.add_track()?;
/// engine.add_clip(track, "take1.wav", ClipSpec::at(0))?;
/// engine.play()?;
/// ```
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    dummy: Option<DummyBehavior>,
    null_control: Option<ClockControl>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn device(mut self, device: DeviceConfig) -> Self {
        self.config.device = device;
        self
    }

    /// Backends to try in order. Null is always tried last.
    pub fn preferences(mut self, preferences: Vec<BackendKind>) -> Self {
        self.config.preferences = preferences;
        self
    }

    pub fn watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.config.watchdog = watchdog;
        self
    }

    pub fn stream(mut self, stream: StreamConfig) -> Self {
        self.config.stream = stream;
        self
    }

    /// Simulated device used when [`BackendKind::Dummy`] is preferred.
    pub fn dummy(mut self, behavior: DummyBehavior) -> Self {
        self.dummy = Some(behavior);
        self
    }

    pub fn null_control(mut self, control: ClockControl) -> Self {
        self.null_control = Some(control);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let xruns = XrunMonitor::new();
        let (scheduler, handle) = MixScheduler::new(&config, Arc::clone(&xruns));

        let mut devices = DeviceManager::builder()
            .config(config.device.clone())
            .preferences(config.preferences.clone())
            .watchdog(config.watchdog)
            .xrun_monitor(xruns);
        if let Some(behavior) = self.dummy {
            devices = devices.dummy(behavior);
        }
        if let Some(control) = self.null_control {
            devices = devices.null_control(control);
        }
        let manager = devices.start(Box::new(scheduler))?;

        let sample_rate = manager
            .session()
            .map_or(config.device.sample_rate.as_u32(), |s| s.sample_rate.as_u32());
        let butler = Butler::spawn(config.stream, sample_rate, config.command_capacity)?;

        tracing::info!(
            "engine started on {} at {} Hz ({:.1} ms latency)",
            manager.device_name(),
            sample_rate,
            manager.buffer_latency_ms()
        );

        let SchedulerHandle {
            commands,
            status,
            retired,
            transport,
            meter,
            dropped_events,
        } = handle;

        Ok(Engine {
            config,
            manager,
            butler,
            control: Mutex::new(Control {
                commands,
                status,
                retired,
                tracks: HashMap::new(),
                finished: HashMap::new(),
            }),
            transport,
            meter,
            dropped_events,
            sample_rate,
            shut_down: false,
        })
    }
}

#[derive(Default)]
struct TrackModel {
    clips: HashMap<ClipId, SourceId>,
    armed: Option<CaptureId>,
}

/// Control-thread ends of the relay plus a mirror of what the mixer holds.
struct Control {
    commands: RelaySender<CommandEnvelope>,
    status: RelayReceiver<StatusEvent>,
    retired: RelayReceiver<Retired>,
    tracks: HashMap<TrackId, TrackModel>,
    /// Frames written by captures the butler has finalised, by track.
    finished: HashMap<TrackId, u64>,
}

/// A running multitrack engine.
///
/// Every method is called from the control thread. Mutations travel to the
/// audio thread as commands and take effect at the next period boundary.
pub struct Engine {
    config: EngineConfig,
    manager: DeviceManager,
    butler: Butler,
    control: Mutex<Control>,
    transport: TransportReader,
    meter: Arc<OutputMeter>,
    dropped_events: Arc<AtomicU64>,
    sample_rate: u32,
    shut_down: bool,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Rate streamed sources and captures are opened at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn transport(&self) -> TransportReader {
        self.transport.clone()
    }

    pub fn meter(&self) -> Arc<OutputMeter> {
        Arc::clone(&self.meter)
    }

    pub fn device_state(&self) -> DeviceState {
        self.manager.state()
    }

    pub fn session(&self) -> Option<Arc<DeviceSession>> {
        self.manager.session()
    }

    pub fn backend(&self) -> Option<BackendKind> {
        self.manager.backend()
    }

    pub fn device_name(&self) -> String {
        self.manager.device_name()
    }

    pub fn cpu_metrics(&self) -> CpuMetrics {
        self.manager.cpu_metrics()
    }

    pub fn xrun_monitor(&self) -> Arc<XrunMonitor> {
        self.manager.xrun_monitor()
    }

    pub fn io_metrics(&self) -> IOMetricsSnapshot {
        self.butler.metrics().snapshot()
    }

    /// Status events lost because `poll` was not called often enough.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Periods the audio callback has completed.
    pub fn periods(&self) -> u64 {
        self.manager.callback_count()
    }

    /// Close the current driver and re-run backend selection. Blocks until the
    /// old driver has stopped calling back; tracks and transport carry over.
    pub fn switch_driver(&self, preferences: Vec<BackendKind>) -> Result<Arc<DeviceSession>> {
        self.ensure_running()?;
        let session = self.manager.switch_driver(preferences)?;
        if session.sample_rate.as_u32() != self.sample_rate {
            tracing::warn!(
                "{} opened at {} Hz, streams stay at {} Hz",
                session.device_name,
                session.sample_rate.as_u32(),
                self.sample_rate
            );
        }
        Ok(session)
    }

    // -- Tracks -----------------------------------------------------------

    pub fn add_track(&self) -> Result<TrackId> {
        {
            let control = self.control.lock();
            if control.tracks.len() >= self.config.max_tracks {
                return Err(Error::TrackLimit(self.config.max_tracks));
            }
        }
        let track = Track::new(self.config.max_clips_per_track);
        let id = track.id();
        self.send(Command::AddTrack(Box::new(track)))?;
        self.control.lock().tracks.insert(id, TrackModel::default());
        tracing::debug!("added track {}", id.0);
        Ok(id)
    }

    /// Remove a track with its clips. An armed capture is finalised.
    pub fn remove_track(&self, track: TrackId) -> Result<()> {
        self.check_track(track)?;
        self.send(Command::RemoveTrack(track))?;
        self.control.lock().tracks.remove(&track);
        Ok(())
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.control.lock().tracks.keys().copied().collect()
    }

    pub fn set_gain(&self, track: TrackId, gain: f32) -> Result<()> {
        self.check_track(track)?;
        self.send(Command::SetGain { track, gain }).map(drop)
    }

    /// `-1.0` is hard left, `1.0` hard right.
    pub fn set_pan(&self, track: TrackId, pan: f32) -> Result<()> {
        self.check_track(track)?;
        self.send(Command::SetPan { track, pan }).map(drop)
    }

    pub fn set_mute(&self, track: TrackId, muted: bool) -> Result<()> {
        self.check_track(track)?;
        self.send(Command::SetMute { track, muted }).map(drop)
    }

    pub fn set_solo(&self, track: TrackId, soloed: bool) -> Result<()> {
        self.check_track(track)?;
        self.send(Command::SetSolo { track, soloed }).map(drop)
    }

    // -- Clips ------------------------------------------------------------

    /// Place a WAV file on a track. The clip is silent until its ring has
    /// been filled from the new position.
    pub fn add_clip(&self, track: TrackId, path: impl AsRef<Path>, spec: ClipSpec) -> Result<ClipId> {
        let path = path.as_ref();
        {
            let control = self.control.lock();
            let model = control.tracks.get(&track).ok_or(Error::UnknownTrack(track))?;
            if model.clips.len() >= self.config.max_clips_per_track {
                return Err(Error::ClipLimit(self.config.max_clips_per_track));
            }
        }

        let source_len = SourceReader::open(path)?.len_frames();
        let spec = ClipSpec {
            length: Some(
                spec.length
                    .unwrap_or_else(|| source_len.saturating_sub(spec.offset)),
            ),
            ..spec
        };
        let source = self.butler.open_source(path)?;
        let source_id = source.id();
        let clip = Clip::new(source, spec);
        let id = clip.id();

        if let Err(e) = self.send(Command::AddClip {
            track,
            clip: Box::new(clip),
        }) {
            let _ = self.butler.close_source(source_id);
            return Err(e);
        }
        if let Some(model) = self.control.lock().tracks.get_mut(&track) {
            model.clips.insert(id, source_id);
        }
        tracing::debug!("clip {} on track {} from {}", id.0, track.0, path.display());
        Ok(id)
    }

    pub fn remove_clip(&self, track: TrackId, clip: ClipId) -> Result<()> {
        self.check_clip(track, clip)?;
        self.send(Command::RemoveClip { track, clip })?;
        if let Some(model) = self.control.lock().tracks.get_mut(&track) {
            model.clips.remove(&clip);
        }
        Ok(())
    }

    pub fn set_clip_gain(&self, track: TrackId, clip: ClipId, gain: f32) -> Result<()> {
        self.check_clip(track, clip)?;
        self.send(Command::SetClipGain { track, clip, gain }).map(drop)
    }

    /// Fill level and counters of a clip's playback ring.
    pub fn clip_status(&self, track: TrackId, clip: ClipId) -> Option<SourceStatus> {
        let source = {
            let control = self.control.lock();
            *control.tracks.get(&track)?.clips.get(&clip)?
        };
        self.butler.source_status(source)
    }

    // -- Recording --------------------------------------------------------

    /// Record stereo input bus `input_bus` to `path` (32-bit float WAV) while
    /// the transport rolls. Re-arming finalises the previous take first.
    pub fn arm_track(&self, track: TrackId, path: impl AsRef<Path>, input_bus: usize) -> Result<()> {
        let already_armed = {
            let control = self.control.lock();
            control
                .tracks
                .get(&track)
                .ok_or(Error::UnknownTrack(track))?
                .armed
                .is_some()
        };
        if already_armed {
            self.disarm_track(track)?;
        }

        let producer = self.butler.open_capture(path.as_ref(), 2)?;
        let capture_id = producer.id();
        self.send(Command::ArmTrack {
            track,
            capture: Box::new(producer),
            input_bus,
        })?;

        let mut control = self.control.lock();
        control.finished.remove(&track);
        if let Some(model) = control.tracks.get_mut(&track) {
            model.armed = Some(capture_id);
        }
        tracing::info!("track {} armed, recording to {}", track.0, path.as_ref().display());
        Ok(())
    }

    /// Stop recording on a track and wait for the take to be finalised.
    /// Returns the number of frames written.
    pub fn disarm_track(&self, track: TrackId) -> Result<u64> {
        {
            let control = self.control.lock();
            let model = control.tracks.get(&track).ok_or(Error::UnknownTrack(track))?;
            if model.armed.is_none() {
                return Err(Error::NotArmed(track));
            }
        }
        self.send(Command::DisarmTrack { track })?;

        let timeout = self.config.command_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut control = self.control.lock();
                self.collect_retired(&mut control);
                if let Some(frames) = control.finished.remove(&track) {
                    if let Some(model) = control.tracks.get_mut(&track) {
                        model.armed = None;
                    }
                    return Ok(frames);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
            thread::sleep(RETRY_INTERVAL * 2);
        }
    }

    // -- Transport --------------------------------------------------------

    pub fn play(&self) -> Result<()> {
        self.send(Command::Play).map(drop)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop).map(drop)
    }

    /// Move the transport. Clips refill asynchronously and stay silent until
    /// their rings are ready.
    pub fn seek(&self, frame: u64) -> Result<()> {
        self.send(Command::Seek(frame)).map(drop)
    }

    // -- Events -----------------------------------------------------------

    /// Drain status events from the mixer and the device manager, logging
    /// each one. Also releases anything the mixer has retired.
    pub fn poll(&self) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        {
            let mut control = self.control.lock();
            self.collect_retired(&mut control);
            control.status.drain(|event| events.push(event));
        }
        events.extend(self.manager.poll_events());

        for event in &events {
            match event.severity() {
                Severity::Info => tracing::trace!("{}", event.describe()),
                Severity::Warning => tracing::warn!("{}", event.describe()),
                Severity::Critical => tracing::error!("{}", event.describe()),
                Severity::Fatal => tracing::error!("FATAL: {}", event.describe()),
            }
        }
        events
    }

    /// Block until all captured audio handed to the butler is on disk.
    pub fn sync_captures(&self) -> Result<()> {
        Ok(self.butler.wait_for_completion()?)
    }

    /// Stop the device, then the butler (which finalises open captures).
    /// Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.manager.stop();
        {
            let mut control = self.control.lock();
            self.collect_retired(&mut control);
        }
        self.butler.stop();
        tracing::info!("engine shut down");
    }

    // -- Internals --------------------------------------------------------

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    fn check_track(&self, track: TrackId) -> Result<()> {
        if self.control.lock().tracks.contains_key(&track) {
            Ok(())
        } else {
            Err(Error::UnknownTrack(track))
        }
    }

    fn check_clip(&self, track: TrackId, clip: ClipId) -> Result<()> {
        let control = self.control.lock();
        let model = control.tracks.get(&track).ok_or(Error::UnknownTrack(track))?;
        if model.clips.contains_key(&clip) {
            Ok(())
        } else {
            Err(Error::UnknownClip(clip))
        }
    }

    /// Enqueue a command, retrying while the relay is full until
    /// `command_timeout` passes.
    fn send(&self, command: Command) -> Result<AckToken> {
        self.ensure_running()?;
        let token = AckToken::generate();
        let name = command.name();
        let mut envelope = CommandEnvelope::with_ack(command, token);
        let deadline = Instant::now() + self.config.command_timeout;

        let mut control = self.control.lock();
        self.collect_retired(&mut control);
        loop {
            match control.commands.try_send(envelope) {
                Ok(()) => return Ok(token),
                Err(full) => {
                    if Instant::now() >= deadline {
                        tracing::warn!("command queue full, {} not sent", name);
                        return Err(stagehand_core::Error::QueueFull.into());
                    }
                    envelope = full.into_inner();
                    thread::sleep(RETRY_INTERVAL);
                }
            }
        }
    }

    /// Release what the mixer handed back: close sources, finalise captures.
    fn collect_retired(&self, control: &mut Control) {
        while let Some(item) = control.retired.try_recv() {
            match item {
                Retired::Track(mut track) => {
                    let id = track.id();
                    for clip in track.clips.drain(..) {
                        self.release_clip(control, id, &clip);
                    }
                    if let Some(producer) = track.take_capture() {
                        self.finish_capture(control, id, producer);
                    }
                    control.tracks.remove(&id);
                }
                Retired::Clip(clip) => {
                    // Rejected clips come back here too, so look the owner up.
                    let owner = control
                        .tracks
                        .iter()
                        .find(|(_, m)| m.clips.contains_key(&clip.id()))
                        .map(|(id, _)| *id);
                    match owner {
                        Some(track) => self.release_clip(control, track, &clip),
                        None => {
                            let _ = self.butler.close_source(clip.source().id());
                        }
                    }
                }
                Retired::Capture { track, producer } => {
                    self.finish_capture(control, track, producer);
                }
            }
        }
    }

    fn release_clip(&self, control: &mut Control, track: TrackId, clip: &Clip) {
        if let Some(model) = control.tracks.get_mut(&track) {
            model.clips.remove(&clip.id());
        }
        if let Err(e) = self.butler.close_source(clip.source().id()) {
            tracing::warn!("closing source for clip {}: {}", clip.id().0, e);
        }
    }

    fn finish_capture(&self, control: &mut Control, track: TrackId, producer: Box<CaptureProducer>) {
        if producer.overruns() > 0 {
            tracing::warn!(
                "capture on track {} lost audio in {} periods",
                track.0,
                producer.overruns()
            );
        }
        match self.butler.finish_capture(producer.id()) {
            Ok(frames) => {
                tracing::info!("track {} capture finished: {} frames", track.0, frames);
                control.finished.insert(track, frames);
            }
            Err(e) => tracing::error!("finalising capture on track {}: {}", track.0, e),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
