//! Shared fixtures for scheduler and engine tests.
//!
//! The scheduler is driven one period at a time through [`Rig`]; playback
//! rings are fed by hand so every test controls exactly what the mixer sees.

#![allow(dead_code)]

use stagehand::core::{BufferPool, PeriodCallback, PeriodIo, PoolStats, XrunMonitor};
use stagehand::stream::{playback_ring, Frame, PlaybackProducer, SourceId};
use stagehand::{
    AckToken, Clip, ClipSpec, Command, CommandEnvelope, EngineConfig, MixScheduler,
    SchedulerHandle, StatusEvent,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const PERIOD: usize = 64;
pub const SAMPLE_RATE: u32 = 44100;

/// Generous upper bound for anything asynchronous.
pub const SETTLE: Duration = Duration::from_secs(5);

/// A scheduler plus the buffers a driver would hand it.
pub struct Rig {
    pub scheduler: MixScheduler,
    pub handle: SchedulerHandle,
    pub xruns: Arc<XrunMonitor>,
    input: BufferPool,
    output: BufferPool,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let xruns = XrunMonitor::new();
        let (scheduler, handle) = MixScheduler::new(&config, Arc::clone(&xruns));
        let stats = PoolStats::new();
        Self {
            scheduler,
            handle,
            xruns,
            input: BufferPool::new(2, PERIOD, 2, Arc::clone(&stats)),
            output: BufferPool::new(2, PERIOD, 2, stats),
        }
    }

    pub fn send(&mut self, command: Command) -> AckToken {
        let token = AckToken::generate();
        assert!(
            self.handle
                .commands
                .try_send(CommandEnvelope::with_ack(command, token))
                .is_ok(),
            "command queue full"
        );
        token
    }

    /// Run one period with silent input. Returns the left and right output.
    pub fn run(&mut self) -> (Vec<f32>, Vec<f32>) {
        self.run_with_input(&[0.0; PERIOD], &[0.0; PERIOD])
    }

    pub fn run_with_input(&mut self, left: &[f32], right: &[f32]) -> (Vec<f32>, Vec<f32>) {
        self.period(left, right, false)
    }

    /// Run one silent period flagged as a device xrun. The xrun is counted
    /// first, as the device monitor does before calling the mixer.
    pub fn run_after_device_xrun(&mut self) -> (Vec<f32>, Vec<f32>) {
        self.xruns.report_underrun();
        self.period(&[0.0; PERIOD], &[0.0; PERIOD], true)
    }

    fn period(&mut self, left: &[f32], right: &[f32], hardware_xrun: bool) -> (Vec<f32>, Vec<f32>) {
        let mut input = self.input.lease(PERIOD);
        input.channel_mut(0).copy_from_slice(&left[..PERIOD]);
        input.channel_mut(1).copy_from_slice(&right[..PERIOD]);
        let output = self.output.lease(PERIOD);
        let mut io = PeriodIo {
            input,
            output,
            frames: PERIOD,
            hardware_xrun,
        };
        self.scheduler.process(&mut io);
        (io.output.channel(0).to_vec(), io.output.channel(1).to_vec())
    }

    pub fn events(&mut self) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        self.handle.status.drain(|e| events.push(e));
        events
    }
}

/// A clip over a hand-fed ring of `capacity` frames.
pub fn fed_clip(spec: ClipSpec, capacity: usize) -> (Box<Clip>, PlaybackProducer) {
    let (producer, consumer) = playback_ring(SourceId::generate(), capacity);
    (Box::new(Clip::new(consumer, spec)), producer)
}

/// Answer the outstanding seek with `frames`. Returns the requested frame.
pub fn serve(producer: &mut PlaybackProducer, frames: &[Frame]) -> u64 {
    let requested = producer.pending_seek().expect("no seek outstanding");
    producer.write(frames);
    producer.complete_seek();
    requested
}

pub fn constant(value: f32, frames: usize) -> Vec<Frame> {
    vec![(value, value); frames]
}

pub fn count_matching(events: &[StatusEvent], f: impl Fn(&StatusEvent) -> bool) -> usize {
    events.iter().filter(|e| f(e)).count()
}

/// Stereo float WAV where frame `i` is `(i / 1e6, -i / 1e6)`.
pub fn write_ramp(path: &Path, frames: u32) {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..frames {
        let v = i as f32 / 1e6;
        writer.write_sample(v).unwrap();
        writer.write_sample(-v).unwrap();
    }
    writer.finalize().unwrap();
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Route `tracing` output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
