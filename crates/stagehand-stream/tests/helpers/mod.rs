//! WAV fixtures for streaming tests.

#![allow(dead_code)]

use hound::{SampleFormat, WavSpec, WavWriter};
use stagehand_stream::{PlaybackConsumer, ReadOutcome};
use std::path::Path;
use std::time::{Duration, Instant};

pub const SAMPLE_RATE: u32 = 44100;

/// Stereo float file where frame `i` is `(i, -i)` scaled into range.
pub fn write_ramp(path: &Path, frames: usize) {
    let spec = WavSpec {
        channels: 2,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    for i in 0..frames {
        writer.write_sample(ramp_value(i as u64)).unwrap();
        writer.write_sample(-ramp_value(i as u64)).unwrap();
    }
    writer.finalize().unwrap();
}

pub fn ramp_value(frame: u64) -> f32 {
    frame as f32 / 1_000_000.0
}

/// Read periods until the source delivers data, then return that period.
pub fn first_delivered(
    source: &mut PlaybackConsumer,
    frames: usize,
    timeout: Duration,
) -> Option<(Vec<f32>, Vec<f32>)> {
    let deadline = Instant::now() + timeout;
    let mut left = vec![0.0; frames];
    let mut right = vec![0.0; frames];
    while Instant::now() < deadline {
        match source.read(&mut left, &mut right) {
            ReadOutcome::Refilling => std::thread::sleep(Duration::from_millis(2)),
            _ => return Some((left, right)),
        }
    }
    None
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
