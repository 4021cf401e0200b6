//! Lock-free ring buffers between the butler and the period callback.
//!
//! Playback rings are filled by the butler ahead of the read cursor; capture
//! rings are drained by it behind the write cursor. The real-time side only
//! ever does non-blocking pops and pushes.
//!
//! Seeking a playback ring is a two-phase handshake over shared atomics:
//! the consumer bumps a generation; the butler records how many frames were
//! already written (everything before that boundary is stale), publishes the
//! boundary, repositions the file and writes fresh frames, then marks the
//! generation ready. Until then the consumer discards stale frames and reads
//! silence without reporting an underrun.
//!
//! A source the butler can no longer read is marked failed. Reads from a
//! failed ring play out whatever is still queued and then report underruns
//! instead of waiting for a refill that will never come.

use crate::request::{CaptureId, SourceId};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// One stereo frame. Mono material is duplicated to both sides.
pub type Frame = (f32, f32);

#[derive(Debug)]
struct PlaybackShared {
    capacity: usize,
    requested_gen: AtomicU64,
    requested_frame: AtomicU64,
    boundary_gen: AtomicU64,
    stale_boundary: AtomicU64,
    ready_gen: AtomicU64,
    written_total: AtomicU64,
    read_total: AtomicU64,
    /// Source frame the mixer reads next.
    position: AtomicU64,
    frames_delivered: AtomicU64,
    underruns: AtomicU64,
    failed: AtomicBool,
}

/// Result of pulling one period from a playback ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The whole request was satisfied.
    Complete,
    /// Waiting for a seek to be serviced; output is silence.
    Refilling,
    /// The ring ran dry; `missing` trailing frames are silence.
    Underrun { missing: usize },
}

/// Create a playback ring holding `capacity` frames.
pub fn playback_ring(id: SourceId, capacity: usize) -> (PlaybackProducer, PlaybackConsumer) {
    let capacity = capacity.max(1);
    let (prod, cons) = HeapRb::<Frame>::new(capacity).split();
    let shared = Arc::new(PlaybackShared {
        capacity,
        requested_gen: AtomicU64::new(0),
        requested_frame: AtomicU64::new(0),
        boundary_gen: AtomicU64::new(0),
        stale_boundary: AtomicU64::new(0),
        ready_gen: AtomicU64::new(0),
        written_total: AtomicU64::new(0),
        read_total: AtomicU64::new(0),
        position: AtomicU64::new(0),
        frames_delivered: AtomicU64::new(0),
        underruns: AtomicU64::new(0),
        failed: AtomicBool::new(false),
    });

    let producer = PlaybackProducer {
        prod,
        shared: Arc::clone(&shared),
        handled_gen: 0,
        awaiting_ready: false,
    };
    let consumer = PlaybackConsumer {
        cons,
        shared,
        id,
        gen: 0,
        stale_done: false,
    };
    (producer, consumer)
}

/// Butler side of a playback ring.
pub struct PlaybackProducer {
    prod: HeapProd<Frame>,
    shared: Arc<PlaybackShared>,
    handled_gen: u64,
    awaiting_ready: bool,
}

impl PlaybackProducer {
    /// Start servicing the latest seek, if one is outstanding. Returns the
    /// source frame to reposition to.
    pub fn pending_seek(&mut self) -> Option<u64> {
        let requested = self.shared.requested_gen.load(Ordering::Acquire);
        if requested <= self.handled_gen {
            return None;
        }
        let frame = self.shared.requested_frame.load(Ordering::Acquire);
        self.handled_gen = requested;
        self.shared.stale_boundary.store(
            self.shared.written_total.load(Ordering::Acquire),
            Ordering::Release,
        );
        self.shared.boundary_gen.store(requested, Ordering::Release);
        self.awaiting_ready = true;
        Some(frame)
    }

    /// Publish the fresh data written since the last `pending_seek`.
    pub fn complete_seek(&mut self) {
        if self.awaiting_ready {
            self.shared
                .ready_gen
                .store(self.handled_gen, Ordering::Release);
            self.awaiting_ready = false;
        }
    }

    /// Give up on this source. Any outstanding seek resolves with no fresh
    /// data, so the consumer underruns instead of refilling forever.
    pub fn fail(&mut self) {
        self.shared.failed.store(true, Ordering::Release);
        self.complete_seek();
    }

    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// The consumer has asked for data at least once.
    pub fn is_active(&self) -> bool {
        self.handled_gen > 0
    }

    pub fn is_awaiting_ready(&self) -> bool {
        self.awaiting_ready
    }

    pub fn write(&mut self, frames: &[Frame]) -> usize {
        let written = self.prod.push_slice(frames);
        self.shared
            .written_total
            .fetch_add(written as u64, Ordering::AcqRel);
        written
    }

    pub fn write_space(&self) -> usize {
        self.prod.vacant_len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn fill(&self) -> f32 {
        self.prod.occupied_len() as f32 / self.shared.capacity as f32
    }
}

/// Real-time side of a playback ring.
pub struct PlaybackConsumer {
    cons: HeapCons<Frame>,
    shared: Arc<PlaybackShared>,
    id: SourceId,
    gen: u64,
    stale_done: bool,
}

impl PlaybackConsumer {
    pub fn id(&self) -> SourceId {
        self.id
    }

    /// Request data from `frame` onwards. Until the butler has refilled the
    /// ring, reads return silence.
    pub fn seek(&mut self, frame: u64) {
        self.gen += 1;
        self.stale_done = false;
        self.shared.requested_frame.store(frame, Ordering::Release);
        self.shared.requested_gen.store(self.gen, Ordering::Release);
    }

    /// True until the butler has published fresh data for the latest seek.
    /// Stale frames still queued ahead of it are dropped by the next read.
    pub fn is_refilling(&self) -> bool {
        !self.is_failed()
            && (self.gen == 0 || self.shared.ready_gen.load(Ordering::Acquire) < self.gen)
    }

    /// The butler stopped streaming this source after a read or seek error.
    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Fraction of the ring currently holding frames.
    pub fn fill(&self) -> f32 {
        self.cons.occupied_len() as f32 / self.shared.capacity as f32
    }

    /// Fill `left`/`right` with the next frames. Never blocks; any shortfall
    /// is silence.
    #[inline]
    pub fn read(&mut self, left: &mut [f32], right: &mut [f32]) -> ReadOutcome {
        let frames = left.len().min(right.len());

        if self.is_failed()
            && (self.gen == 0 || self.shared.ready_gen.load(Ordering::Acquire) < self.gen)
        {
            // The seek will never be serviced.
            silence(left, right, 0);
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
            return ReadOutcome::Underrun { missing: frames };
        }
        if self.gen == 0 || !self.discard_stale() {
            silence(left, right, 0);
            return ReadOutcome::Refilling;
        }
        if self.shared.ready_gen.load(Ordering::Acquire) < self.gen {
            silence(left, right, 0);
            return ReadOutcome::Refilling;
        }

        let mut n = 0;
        while n < frames {
            match self.cons.try_pop() {
                Some((l, r)) => {
                    left[n] = l;
                    right[n] = r;
                    n += 1;
                }
                None => break,
            }
        }
        self.shared
            .read_total
            .fetch_add(n as u64, Ordering::AcqRel);
        self.shared.position.fetch_add(n as u64, Ordering::AcqRel);
        self.shared
            .frames_delivered
            .fetch_add(n as u64, Ordering::Relaxed);

        if n < frames {
            silence(left, right, n);
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
            return ReadOutcome::Underrun { missing: frames - n };
        }
        ReadOutcome::Complete
    }

    /// Drop frames written before the current seek. Returns false while the
    /// butler has not yet published the boundary.
    fn discard_stale(&mut self) -> bool {
        if self.stale_done {
            return true;
        }
        if self.shared.boundary_gen.load(Ordering::Acquire) < self.gen {
            return false;
        }
        let boundary = self.shared.stale_boundary.load(Ordering::Acquire);
        let read = self.shared.read_total.load(Ordering::Acquire);
        if boundary > read {
            let skipped = self.cons.skip((boundary - read) as usize);
            self.shared
                .read_total
                .fetch_add(skipped as u64, Ordering::AcqRel);
            if read + (skipped as u64) < boundary {
                return false;
            }
        }
        self.shared.position.store(
            self.shared.requested_frame.load(Ordering::Acquire),
            Ordering::Release,
        );
        self.stale_done = true;
        true
    }

    pub fn monitor(&self) -> SourceMonitor {
        SourceMonitor {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[inline]
fn silence(left: &mut [f32], right: &mut [f32], from: usize) {
    if from < left.len() {
        left[from..].fill(0.0);
    }
    if from < right.len() {
        right[from..].fill(0.0);
    }
}

/// Point-in-time view of a playback source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceStatus {
    pub fill: f32,
    pub underruns: u64,
    pub frames_delivered: u64,
    pub position: u64,
    /// The source could not be read and has stopped streaming.
    pub failed: bool,
}

/// Read-only handle on a playback ring's counters, usable from any thread.
#[derive(Debug, Clone)]
pub struct SourceMonitor {
    shared: Arc<PlaybackShared>,
}

impl SourceMonitor {
    pub fn status(&self) -> SourceStatus {
        let written = self.shared.written_total.load(Ordering::Acquire);
        let read = self.shared.read_total.load(Ordering::Acquire);
        SourceStatus {
            fill: written.saturating_sub(read) as f32 / self.shared.capacity as f32,
            underruns: self.shared.underruns.load(Ordering::Relaxed),
            frames_delivered: self.shared.frames_delivered.load(Ordering::Relaxed),
            position: self.shared.position.load(Ordering::Acquire),
            failed: self.shared.failed.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug)]
struct CaptureShared {
    capacity: usize,
    captured: AtomicU64,
    written: AtomicU64,
    overruns: AtomicU64,
}

pub(crate) fn capture_ring(
    id: CaptureId,
    channels: u16,
    capacity: usize,
) -> (CaptureProducer, CaptureConsumer) {
    let capacity = capacity.max(1);
    let (prod, cons) = HeapRb::<Frame>::new(capacity).split();
    let shared = Arc::new(CaptureShared {
        capacity,
        captured: AtomicU64::new(0),
        written: AtomicU64::new(0),
        overruns: AtomicU64::new(0),
    });
    (
        CaptureProducer {
            prod,
            shared: Arc::clone(&shared),
            id,
            channels,
        },
        CaptureConsumer { cons, shared },
    )
}

/// Real-time side of a capture ring.
pub struct CaptureProducer {
    prod: HeapProd<Frame>,
    shared: Arc<CaptureShared>,
    id: CaptureId,
    channels: u16,
}

impl CaptureProducer {
    pub fn id(&self) -> CaptureId {
        self.id
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Push one period. Returns the frames accepted; fewer than offered is an
    /// overrun and the excess is dropped.
    #[inline]
    pub fn push(&mut self, left: &[f32], right: &[f32]) -> usize {
        let frames = left.len().min(right.len());
        let mut pushed = 0;
        for i in 0..frames {
            if self.prod.try_push((left[i], right[i])).is_err() {
                break;
            }
            pushed += 1;
        }
        self.shared
            .captured
            .fetch_add(pushed as u64, Ordering::Relaxed);
        if pushed < frames {
            self.shared.overruns.fetch_add(1, Ordering::Relaxed);
        }
        pushed
    }

    pub fn fill(&self) -> f32 {
        self.prod.occupied_len() as f32 / self.shared.capacity as f32
    }

    pub fn frames_captured(&self) -> u64 {
        self.shared.captured.load(Ordering::Relaxed)
    }

    pub fn frames_written(&self) -> u64 {
        self.shared.written.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }
}

/// Butler side of a capture ring.
pub(crate) struct CaptureConsumer {
    cons: HeapCons<Frame>,
    shared: Arc<CaptureShared>,
}

impl CaptureConsumer {
    pub(crate) fn available(&self) -> usize {
        self.cons.occupied_len()
    }

    pub(crate) fn read_into(&mut self, buffer: &mut [Frame]) -> usize {
        self.cons.pop_slice(buffer)
    }

    pub(crate) fn add_frames_written(&self, count: u64) {
        self.shared.written.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn frames_written(&self) -> u64 {
        self.shared.written.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: f32, len: usize) -> Vec<Frame> {
        (0..len).map(|i| (start + i as f32, -(start + i as f32))).collect()
    }

    fn read_period(cons: &mut PlaybackConsumer, frames: usize) -> (ReadOutcome, Vec<f32>, Vec<f32>) {
        let mut l = vec![1.0; frames];
        let mut r = vec![1.0; frames];
        let outcome = cons.read(&mut l, &mut r);
        (outcome, l, r)
    }

    #[test]
    fn test_silent_until_first_seek_serviced() {
        let (mut prod, mut cons) = playback_ring(SourceId::generate(), 64);
        let (outcome, l, _) = read_period(&mut cons, 8);
        assert_eq!(outcome, ReadOutcome::Refilling);
        assert!(l.iter().all(|&s| s == 0.0));
        assert!(!prod.is_active());

        cons.seek(0);
        assert_eq!(prod.pending_seek(), Some(0));
        assert!(prod.is_active());
        assert_eq!(read_period(&mut cons, 8).0, ReadOutcome::Refilling);

        prod.write(&ramp(0.0, 16));
        prod.complete_seek();
        let (outcome, l, r) = read_period(&mut cons, 8);
        assert_eq!(outcome, ReadOutcome::Complete);
        assert_eq!(l[0], 0.0);
        assert_eq!(l[7], 7.0);
        assert_eq!(r[7], -7.0);
    }

    #[test]
    fn test_seek_discards_stale_frames() {
        let (mut prod, mut cons) = playback_ring(SourceId::generate(), 64);
        cons.seek(0);
        prod.pending_seek();
        prod.write(&ramp(0.0, 40));
        prod.complete_seek();
        read_period(&mut cons, 4);

        cons.seek(1000);
        assert_eq!(prod.pending_seek(), Some(1000));
        prod.write(&ramp(1000.0, 20));
        prod.complete_seek();

        let (outcome, l, _) = read_period(&mut cons, 4);
        assert_eq!(outcome, ReadOutcome::Complete);
        assert_eq!(l, vec![1000.0, 1001.0, 1002.0, 1003.0]);
        assert_eq!(cons.monitor().status().position, 1004);
    }

    #[test]
    fn test_full_ring_of_stale_data_drains_before_refill() {
        let (mut prod, mut cons) = playback_ring(SourceId::generate(), 32);
        cons.seek(0);
        prod.pending_seek();
        prod.write(&ramp(0.0, 32));
        prod.complete_seek();
        assert_eq!(prod.write_space(), 0);

        cons.seek(500);
        prod.pending_seek();
        // Consumer discards once it sees the boundary.
        assert_eq!(read_period(&mut cons, 4).0, ReadOutcome::Refilling);
        assert_eq!(prod.write_space(), 32);

        prod.write(&ramp(500.0, 8));
        prod.complete_seek();
        let (_, l, _) = read_period(&mut cons, 2);
        assert_eq!(l, vec![500.0, 501.0]);
    }

    #[test]
    fn test_one_underrun_per_short_read() {
        let (mut prod, mut cons) = playback_ring(SourceId::generate(), 64);
        cons.seek(0);
        prod.pending_seek();
        prod.write(&ramp(1.0, 3));
        prod.complete_seek();

        let (outcome, l, _) = read_period(&mut cons, 8);
        assert_eq!(outcome, ReadOutcome::Underrun { missing: 5 });
        assert_eq!(&l[..4], &[1.0, 2.0, 3.0, 0.0]);
        assert_eq!(
            read_period(&mut cons, 8).0,
            ReadOutcome::Underrun { missing: 8 }
        );
        assert_eq!(cons.monitor().status().underruns, 2);
    }

    #[test]
    fn test_newer_seek_supersedes_pending_one() {
        let (mut prod, mut cons) = playback_ring(SourceId::generate(), 64);
        cons.seek(10);
        cons.seek(20);
        assert_eq!(prod.pending_seek(), Some(20));
        assert_eq!(prod.pending_seek(), None);
        prod.write(&ramp(20.0, 4));
        prod.complete_seek();
        assert_eq!(read_period(&mut cons, 1).1, vec![20.0]);
    }

    #[test]
    fn test_failed_seek_underruns_instead_of_refilling() {
        let (mut prod, mut cons) = playback_ring(SourceId::generate(), 64);
        cons.seek(0);
        assert_eq!(prod.pending_seek(), Some(0));
        assert!(cons.is_refilling());

        prod.fail();
        assert!(!cons.is_refilling());
        assert!(cons.is_failed());
        assert_eq!(
            read_period(&mut cons, 8).0,
            ReadOutcome::Underrun { missing: 8 }
        );

        // Later seeks are never serviced either.
        cons.seek(100);
        let (outcome, l, _) = read_period(&mut cons, 8);
        assert_eq!(outcome, ReadOutcome::Underrun { missing: 8 });
        assert!(l.iter().all(|&s| s == 0.0));

        let status = cons.monitor().status();
        assert!(status.failed);
        assert_eq!(status.underruns, 2);
    }

    #[test]
    fn test_failure_mid_stream_plays_out_queued_frames() {
        let (mut prod, mut cons) = playback_ring(SourceId::generate(), 64);
        cons.seek(0);
        prod.pending_seek();
        prod.write(&ramp(0.0, 6));
        prod.complete_seek();
        prod.fail();

        let (outcome, l, _) = read_period(&mut cons, 4);
        assert_eq!(outcome, ReadOutcome::Complete);
        assert_eq!(l, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(
            read_period(&mut cons, 4).0,
            ReadOutcome::Underrun { missing: 2 }
        );
    }

    #[test]
    fn test_capture_overrun_counted() {
        let (mut prod, mut cons) = capture_ring(CaptureId::generate(), 2, 4);
        let l = [0.1, 0.2, 0.3];
        let r = [0.4, 0.5, 0.6];
        assert_eq!(prod.push(&l, &r), 3);
        assert_eq!(prod.push(&l, &r), 1);
        assert_eq!(prod.overruns(), 1);
        assert_eq!(prod.frames_captured(), 4);

        let mut buf = [(0.0, 0.0); 8];
        assert_eq!(cons.read_into(&mut buf), 4);
        assert_eq!(buf[3], (0.1, 0.4));
    }
}
