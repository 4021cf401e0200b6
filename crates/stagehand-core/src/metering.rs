//! CPU load tracking for the period callback.

use crate::lockfree::AtomicFloat;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// CPU metrics snapshot.
#[derive(Debug, Clone, Default)]
pub struct CpuMetrics {
    pub average: f32,
    pub peak: f32,
    pub current: f32,
    /// Callbacks that took longer than their period.
    pub deadline_misses: u64,
}

/// Load of the period callback relative to the period duration.
#[derive(Debug, Default)]
pub struct CpuMeter {
    current: AtomicFloat,
    peak: AtomicFloat,
    average: AtomicFloat,
    deadline_misses: AtomicU64,
    samples: AtomicU32,
}

impl CpuMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one callback. Called from the audio thread.
    #[inline]
    pub fn record(&self, elapsed: Duration, period: Duration) {
        let max_time = period.as_secs_f64();
        if max_time <= 0.0 {
            return;
        }
        let load = (elapsed.as_secs_f64() / max_time) as f32;

        self.current.set(load);
        self.peak.fetch_max(load);

        // Exponential moving average
        let count = self.samples.fetch_add(1, Ordering::Relaxed);
        let alpha = 1.0 / (count.min(100) + 1) as f32;
        let avg = self.average.get();
        self.average.set(avg * (1.0 - alpha) + load * alpha);

        if elapsed > period {
            self.deadline_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn metrics(&self) -> CpuMetrics {
        CpuMetrics {
            average: self.average.get() * 100.0,
            peak: self.peak.get() * 100.0,
            current: self.current.get() * 100.0,
            deadline_misses: self.deadline_misses.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.current.set(0.0);
        self.peak.set(0.0);
        self.average.set(0.0);
        self.deadline_misses.store(0, Ordering::Relaxed);
        self.samples.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_load_relative_to_period() {
        let meter = CpuMeter::new();
        meter.record(Duration::from_millis(5), Duration::from_millis(10));
        let m = meter.metrics();
        assert_relative_eq!(m.current, 50.0, epsilon = 1e-3);
        assert_relative_eq!(m.peak, 50.0, epsilon = 1e-3);
        assert_eq!(m.deadline_misses, 0);
    }

    #[test]
    fn test_deadline_miss_and_reset() {
        let meter = CpuMeter::new();
        meter.record(Duration::from_millis(12), Duration::from_millis(10));
        meter.record(Duration::from_millis(1), Duration::from_millis(10));
        let m = meter.metrics();
        assert_eq!(m.deadline_misses, 1);
        assert_relative_eq!(m.peak, 120.0, epsilon = 1e-3);
        meter.reset();
        assert_eq!(meter.metrics().peak, 0.0);
    }
}
