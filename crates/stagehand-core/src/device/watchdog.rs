//! Stall and underrun-storm detection.
//!
//! Both detectors are plain state machines fed by the watchdog thread, so
//! their timing can be tested without a running driver.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Presumes the driver hung when the callback counter stops advancing.
#[derive(Debug)]
pub(crate) struct StallDetector {
    threshold: Duration,
    last_cycles: u64,
    last_progress: Instant,
}

impl StallDetector {
    pub(crate) fn new(threshold: Duration, cycles: u64, now: Instant) -> Self {
        Self {
            threshold,
            last_cycles: cycles,
            last_progress: now,
        }
    }

    pub(crate) fn reset(&mut self, cycles: u64, now: Instant) {
        self.last_cycles = cycles;
        self.last_progress = now;
    }

    /// Returns true once no callback has run for longer than the threshold.
    pub(crate) fn observe(&mut self, cycles: u64, now: Instant) -> bool {
        if cycles != self.last_cycles {
            self.reset(cycles, now);
            return false;
        }
        now.duration_since(self.last_progress) > self.threshold
    }
}

/// Rolling window of underrun timestamps.
#[derive(Debug)]
pub(crate) struct StormDetector {
    threshold: u32,
    window: Duration,
    events: VecDeque<Instant>,
}

impl StormDetector {
    pub(crate) fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            events: VecDeque::with_capacity(threshold as usize),
        }
    }

    /// Record `count` new underruns at `now`. Returns true when the window
    /// holds at least `threshold` of them.
    pub(crate) fn record(&mut self, count: u64, now: Instant) -> bool {
        let keep = self.threshold as u64;
        for _ in 0..count.min(keep) {
            self.events.push_back(now);
        }
        while let Some(&oldest) = self.events.front() {
            if now.duration_since(oldest) > self.window || self.events.len() as u64 > keep {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.len() as u64 >= keep
    }

    pub(crate) fn count(&self) -> u32 {
        self.events.len() as u32
    }

    pub(crate) fn clear(&mut self) {
        self.events.clear();
    }
}
