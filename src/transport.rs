//! Transport state published by the mixer.

use stagehand_core::{AtomicFlag, AtomicFloat};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct TransportShared {
    position: AtomicU64,
    rolling: AtomicFlag,
}

impl TransportShared {
    #[inline]
    pub(crate) fn publish(&self, position: u64, rolling: bool) {
        self.position.store(position, Ordering::Release);
        self.rolling.set(rolling);
    }
}

/// Lock-free view of the transport for the control thread.
#[derive(Debug, Clone)]
pub struct TransportReader {
    shared: Arc<TransportShared>,
}

impl TransportReader {
    pub(crate) fn new(shared: Arc<TransportShared>) -> Self {
        Self { shared }
    }

    /// Timeline frame of the next period.
    pub fn position(&self) -> u64 {
        self.shared.position.load(Ordering::Acquire)
    }

    pub fn is_rolling(&self) -> bool {
        self.shared.rolling.get()
    }

    pub fn position_seconds(&self, sample_rate: u32) -> f64 {
        self.position() as f64 / sample_rate.max(1) as f64
    }
}

/// Post-sum output levels. Clipping is counted, never corrected.
#[derive(Debug, Default)]
pub struct OutputMeter {
    clipped_periods: AtomicU64,
    last_clip_peak: AtomicFloat,
    peak: AtomicFloat,
}

impl OutputMeter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub(crate) fn record(&self, peak: f32) {
        self.peak.set(peak);
        if peak > 1.0 {
            self.clipped_periods.fetch_add(1, Ordering::AcqRel);
            self.last_clip_peak.set(peak);
        }
    }

    /// Periods whose master output exceeded full scale.
    pub fn clipped_periods(&self) -> u64 {
        self.clipped_periods.load(Ordering::Acquire)
    }

    pub fn last_clip_peak(&self) -> f32 {
        self.last_clip_peak.get()
    }

    /// Peak magnitude of the most recent period.
    pub fn peak(&self) -> f32 {
        self.peak.get()
    }

    pub fn reset(&self) {
        self.clipped_periods.store(0, Ordering::Release);
        self.last_clip_peak.set(0.0);
        self.peak.set(0.0);
    }
}
