//! Pre-allocated period storage.
//!
//! A pool owns `channels × period_size × period_count` samples, allocated
//! once when a session opens. Each callback leases the next period slot
//! round-robin; nothing is allocated or freed until the pool is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Allocation counters shared by every pool a driver creates.
#[derive(Debug, Default)]
pub struct PoolStats {
    allocated_samples: AtomicUsize,
    live_pools: AtomicUsize,
    leased: AtomicUsize,
}

impl PoolStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn allocated_samples(&self) -> usize {
        self.allocated_samples.load(Ordering::Acquire)
    }

    pub fn live_pools(&self) -> usize {
        self.live_pools.load(Ordering::Acquire)
    }

    /// Period buffers currently handed out to a callback.
    pub fn leased(&self) -> usize {
        self.leased.load(Ordering::Acquire)
    }

    /// True when no storage is held and nothing is leased.
    pub fn is_idle(&self) -> bool {
        self.allocated_samples() == 0 && self.live_pools() == 0 && self.leased() == 0
    }
}

pub struct BufferPool {
    storage: Vec<f32>,
    channels: usize,
    period_size: usize,
    period_count: usize,
    cursor: usize,
    stats: Arc<PoolStats>,
}

impl BufferPool {
    pub fn new(
        channels: usize,
        period_size: usize,
        period_count: usize,
        stats: Arc<PoolStats>,
    ) -> Self {
        let period_count = period_count.max(1);
        let len = channels * period_size * period_count;
        stats.allocated_samples.fetch_add(len, Ordering::AcqRel);
        stats.live_pools.fetch_add(1, Ordering::AcqRel);

        Self {
            storage: vec![0.0; len],
            channels,
            period_size,
            period_count,
            cursor: 0,
            stats,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn period_size(&self) -> usize {
        self.period_size
    }

    pub fn capacity_samples(&self) -> usize {
        self.storage.len()
    }

    /// Lease the next period slot, zeroed, sized for `frames` (clamped to the period size).
    #[inline]
    pub fn lease(&mut self, frames: usize) -> PeriodBuffer<'_> {
        let slot_len = self.channels * self.period_size;
        let start = self.cursor * slot_len;
        self.cursor = (self.cursor + 1) % self.period_count;

        let data = &mut self.storage[start..start + slot_len];
        data.fill(0.0);
        self.stats.leased.fetch_add(1, Ordering::AcqRel);

        PeriodBuffer {
            data,
            channels: self.channels,
            frames: frames.min(self.period_size),
            stride: self.period_size,
            stats: &self.stats,
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.stats
            .allocated_samples
            .fetch_sub(self.storage.len(), Ordering::AcqRel);
        self.stats.live_pools.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One period of planar (per-channel) samples.
pub struct PeriodBuffer<'a> {
    data: &'a mut [f32],
    channels: usize,
    frames: usize,
    stride: usize,
    stats: &'a PoolStats,
}

impl PeriodBuffer<'_> {
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn channel(&self, ch: usize) -> &[f32] {
        let start = ch * self.stride;
        &self.data[start..start + self.frames]
    }

    #[inline]
    pub fn channel_mut(&mut self, ch: usize) -> &mut [f32] {
        let start = ch * self.stride;
        &mut self.data[start..start + self.frames]
    }

    pub fn silence(&mut self) {
        self.data.fill(0.0);
    }

    /// Copy from an interleaved slice into the planar layout.
    #[inline]
    pub fn deinterleave_from(&mut self, interleaved: &[f32], src_channels: usize) {
        if src_channels == 0 {
            return;
        }
        let frames = (interleaved.len() / src_channels).min(self.frames);
        for ch in 0..self.channels.min(src_channels) {
            let start = ch * self.stride;
            let dst = &mut self.data[start..start + frames];
            for (i, s) in dst.iter_mut().enumerate() {
                *s = interleaved[i * src_channels + ch];
            }
        }
    }

    /// Write the planar samples into an interleaved slice, converting each sample.
    #[inline]
    pub fn interleave_into<T, F: Fn(f32) -> T>(&self, out: &mut [T], dst_channels: usize, convert: F) {
        if dst_channels == 0 {
            return;
        }
        let frames = (out.len() / dst_channels).min(self.frames);
        for i in 0..frames {
            for ch in 0..dst_channels {
                let sample = if ch < self.channels {
                    self.data[ch * self.stride + i]
                } else {
                    0.0
                };
                out[i * dst_channels + ch] = convert(sample);
            }
        }
    }
}

impl Drop for PeriodBuffer<'_> {
    fn drop(&mut self) {
        self.stats.leased.fetch_sub(1, Ordering::AcqRel);
    }
}
