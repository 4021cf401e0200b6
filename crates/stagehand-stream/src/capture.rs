//! Capture flushing for the butler thread.

use crate::error::Result;
use crate::metrics::IOMetrics;
use crate::request::CaptureId;
use crate::ring::{CaptureConsumer, Frame};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

pub(crate) struct CaptureState {
    pub consumer: CaptureConsumer,
    pub writer: WavWriter<BufWriter<File>>,
    pub path: PathBuf,
    pub channels: u16,
}

/// Captures are written as 32-bit float WAV.
pub(crate) fn create_wav_writer(
    path: &Path,
    sample_rate: u32,
    channels: u16,
) -> Result<WavWriter<BufWriter<File>>> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    Ok(WavWriter::create(path, spec)?)
}

/// Move up to `max_frames` from the ring to the file. Returns frames written.
pub(crate) fn flush_capture(
    state: &mut CaptureState,
    metrics: &IOMetrics,
    max_frames: usize,
    scratch: &mut Vec<Frame>,
) -> Result<usize> {
    let mut total = 0;
    loop {
        let to_read = state.consumer.available().min(max_frames - total);
        if to_read == 0 {
            break;
        }
        scratch.resize(to_read, (0.0, 0.0));
        let read = state.consumer.read_into(&mut scratch[..to_read]);

        for &(left, right) in &scratch[..read] {
            state.writer.write_sample(left)?;
            if state.channels > 1 {
                state.writer.write_sample(right)?;
            }
        }
        metrics.record_write(read as u64 * state.channels as u64 * 4);
        state.consumer.add_frames_written(read as u64);
        total += read;
    }
    Ok(total)
}

pub(crate) fn flush_all_captures(
    captures: &mut HashMap<CaptureId, CaptureState>,
    metrics: &IOMetrics,
    threshold: usize,
    force: bool,
    scratch: &mut Vec<Frame>,
) {
    for (id, state) in captures.iter_mut() {
        if !force && state.consumer.available() < threshold {
            continue;
        }
        let limit = if force { usize::MAX } else { threshold };
        if let Err(e) = flush_capture(state, metrics, limit, scratch) {
            tracing::error!("capture {} flush to {} failed: {}", id.0, state.path.display(), e);
        }
        if force {
            if let Err(e) = state.writer.flush() {
                tracing::error!("capture {} sync failed: {}", id.0, e);
            }
        }
    }
}

/// Drain everything left and finalise the WAV header.
pub(crate) fn finish_capture(
    mut state: CaptureState,
    metrics: &IOMetrics,
    scratch: &mut Vec<Frame>,
) -> Result<u64> {
    flush_capture(&mut state, metrics, usize::MAX, scratch)?;
    let frames = state.consumer.frames_written();
    state.writer.finalize()?;
    tracing::info!("capture finalised: {} ({} frames)", state.path.display(), frames);
    Ok(frames)
}
