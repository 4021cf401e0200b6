//! I/O statistics for the butler thread.
//!
//! Tracks throughput and buffer health. The read rate feeds varifill chunk
//! sizing.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct IOMetrics {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    seeks: AtomicU64,
    /// Refills that found a ring below the low-water mark.
    low_buffer_events: AtomicU64,
    throughput: Mutex<ThroughputTracker>,
}

/// Recent reads within a one second sliding window.
#[derive(Default)]
struct ThroughputTracker {
    recent_reads: Vec<(u64, Instant)>,
    cached_read_rate: f64,
}

impl ThroughputTracker {
    const WINDOW: Duration = Duration::from_secs(1);

    fn record_read(&mut self, bytes: u64, now: Instant) {
        self.recent_reads.push((bytes, now));
        self.recent_reads
            .retain(|(_, ts)| now.duration_since(*ts) < Self::WINDOW);

        let total: u64 = self.recent_reads.iter().map(|(b, _)| *b).sum();
        let span = match (self.recent_reads.first(), self.recent_reads.last()) {
            (Some(first), Some(last)) => last.1.duration_since(first.1).as_secs_f64(),
            _ => 0.0,
        };
        self.cached_read_rate = if span > 0.01 {
            total as f64 / span
        } else {
            total as f64 / Self::WINDOW.as_secs_f64()
        };
    }
}

impl IOMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        if let Some(mut tracker) = self.throughput.try_lock() {
            tracker.record_read(bytes, Instant::now());
        }
    }

    /// Recent read throughput in bytes/second.
    pub fn read_rate(&self) -> f64 {
        self.throughput.lock().cached_read_rate
    }

    #[inline]
    pub fn record_write(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.write_ops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_seek(&self) {
        self.seeks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_low_buffer(&self) {
        self.low_buffer_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IOMetricsSnapshot {
        IOMetricsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            seeks: self.seeks.load(Ordering::Relaxed),
            low_buffer_events: self.low_buffer_events.load(Ordering::Relaxed),
            read_rate: self.read_rate(),
        }
    }

    pub fn reset(&self) {
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.read_ops.store(0, Ordering::Relaxed);
        self.write_ops.store(0, Ordering::Relaxed);
        self.seeks.store(0, Ordering::Relaxed);
        self.low_buffer_events.store(0, Ordering::Relaxed);
        *self.throughput.lock() = ThroughputTracker::default();
    }
}

/// Snapshot of I/O metrics at a point in time.
#[derive(Debug, Clone, Default)]
pub struct IOMetricsSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_ops: u64,
    pub write_ops: u64,
    pub seeks: u64,
    pub low_buffer_events: u64,
    /// Bytes/second over the last second of reads.
    pub read_rate: f64,
}

impl IOMetricsSnapshot {
    pub fn avg_read_size(&self) -> u64 {
        if self.read_ops == 0 {
            0
        } else {
            self.bytes_read / self.read_ops
        }
    }

    pub fn avg_write_size(&self) -> u64 {
        if self.write_ops == 0 {
            0
        } else {
            self.bytes_written / self.write_ops
        }
    }
}
