//! Playback ring refill for the butler thread.

use crate::config::StreamConfig;
use crate::metrics::IOMetrics;
use crate::reader::SourceReader;
use crate::request::SourceId;
use crate::ring::{Frame, PlaybackProducer};
use rayon::prelude::*;

/// A streamed source as the butler sees it.
pub(crate) struct SourceSlot {
    pub id: SourceId,
    pub reader: Box<SourceReader>,
    pub producer: PlaybackProducer,
    /// Fresh frames written since the last seek.
    fresh: usize,
}

impl SourceSlot {
    pub(crate) fn new(id: SourceId, reader: Box<SourceReader>, producer: PlaybackProducer) -> Self {
        Self {
            id,
            reader,
            producer,
            fresh: 0,
        }
    }
}

/// Chunk size in frames using the varifill strategy.
///
/// Emptier rings and faster disks get larger reads.
#[inline]
pub(crate) fn calculate_varifill_chunk(
    buffer_fill: f32,
    base_chunk: usize,
    read_rate_bytes_per_sec: f64,
) -> usize {
    let urgency = (1.0 - buffer_fill.clamp(0.0, 1.0)) as f64;

    const BASELINE_RATE: f64 = 10_000_000.0;
    let bandwidth_factor = if read_rate_bytes_per_sec > 0.0 {
        (read_rate_bytes_per_sec / BASELINE_RATE)
            .sqrt()
            .clamp(0.5, 2.0)
    } else {
        1.0
    };

    let multiplier = ((0.5 + urgency * 1.5) * bandwidth_factor).clamp(0.25, 4.0);
    ((base_chunk as f64 * multiplier) as usize).max(1024)
}

/// Service a pending seek and top up one ring. Returns true if any frames
/// were written.
pub(crate) fn refill_source(
    slot: &mut SourceSlot,
    config: &StreamConfig,
    read_rate: f64,
    metrics: &IOMetrics,
    buf: &mut Vec<Frame>,
) -> bool {
    if slot.producer.is_failed() {
        return false;
    }

    if let Some(frame) = slot.producer.pending_seek() {
        metrics.record_seek();
        slot.fresh = 0;
        if let Err(e) = slot.reader.seek(frame) {
            tracing::error!("seek failed on {}: {}", slot.reader.path().display(), e);
            slot.producer.fail();
            return false;
        }
    }
    if !slot.producer.is_active() {
        return false;
    }

    let fill = slot.producer.fill();
    let seeking = slot.producer.is_awaiting_ready();
    if !seeking {
        if fill >= config.refill_threshold {
            return false;
        }
        if fill < config.low_water {
            metrics.record_low_buffer();
        }
    }

    let space = slot.producer.write_space();
    if space == 0 {
        return false;
    }
    let chunk = calculate_varifill_chunk(fill, config.chunk_frames, read_rate).min(space);

    buf.clear();
    match slot.reader.read(buf, chunk) {
        Ok(from_file) if from_file > 0 => {
            metrics.record_read(from_file as u64 * slot.reader.bytes_per_frame());
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!("read failed on {}: {}", slot.reader.path().display(), e);
            slot.producer.fail();
            return false;
        }
    }

    let written = slot.producer.write(buf);
    slot.fresh += written;
    let ready_at = config.chunk_frames.min(slot.producer.capacity() / 2).max(1);
    if seeking && slot.fresh >= ready_at {
        slot.producer.complete_seek();
    }
    written > 0
}

/// Refill every source sequentially with a reused scratch buffer.
pub(crate) fn refill_all(
    slots: &mut [SourceSlot],
    config: &StreamConfig,
    metrics: &IOMetrics,
    buf: &mut Vec<Frame>,
) -> bool {
    let read_rate = metrics.read_rate();
    let mut worked = false;
    for slot in slots.iter_mut() {
        worked |= refill_source(slot, config, read_rate, metrics, buf);
    }
    worked
}

/// Parallel refill with rayon. Each worker gets exclusive access to one
/// slot and its own thread-local scratch buffer.
pub(crate) fn refill_all_parallel(
    slots: &mut [SourceSlot],
    config: &StreamConfig,
    metrics: &IOMetrics,
) -> bool {
    let read_rate = metrics.read_rate();

    thread_local! {
        static LOCAL_BUF: std::cell::RefCell<Vec<Frame>> =
            std::cell::RefCell::new(Vec::with_capacity(16384));
    }

    slots
        .par_iter_mut()
        .map(|slot| {
            LOCAL_BUF.with(|buf| {
                refill_source(slot, config, read_rate, metrics, &mut buf.borrow_mut())
            })
        })
        .reduce(|| false, |a, b| a || b)
}
