//! Timer-driven period clock used by the Null and Dummy backends.

use super::PeriodCallback;
use super::PeriodIo;
use crate::error::DriverError;
use crate::lockfree::AtomicFlag;
use crate::pool::BufferPool;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thread_priority::ThreadPriority;

#[derive(Debug, Default)]
struct ClockShared {
    halted: AtomicFlag,
    device_lost: AtomicFlag,
    pending_xruns: AtomicU32,
    cycles: AtomicU64,
    panics: AtomicU64,
}

/// Remote control for a clocked backend.
///
/// Lets a caller suspend callbacks (simulating a hung driver), flag xruns on
/// upcoming periods, or report the device as gone.
#[derive(Debug, Clone, Default)]
pub struct ClockControl {
    shared: Arc<ClockShared>,
}

impl ClockControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop invoking the callback without stopping the thread.
    pub fn halt(&self) {
        self.shared.halted.set(true);
    }

    pub fn resume(&self) {
        self.shared.halted.set(false);
    }

    pub fn is_halted(&self) -> bool {
        self.shared.halted.get()
    }

    /// Flag the next `count` periods as hardware xruns.
    pub fn inject_xruns(&self, count: u32) {
        self.shared.pending_xruns.fetch_add(count, Ordering::AcqRel);
    }

    pub fn lose_device(&self) {
        self.shared.device_lost.set(true);
    }

    pub fn device_lost(&self) -> bool {
        self.shared.device_lost.get()
    }

    /// Callbacks invoked so far.
    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Acquire)
    }

    /// Callbacks that panicked and were silenced.
    pub fn panics(&self) -> u64 {
        self.shared.panics.load(Ordering::Acquire)
    }

    fn take_xrun(&self) -> bool {
        self.shared
            .pending_xruns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub(crate) struct Pools {
    pub input: BufferPool,
    pub output: BufferPool,
}

pub(crate) struct ClockThread {
    shutdown: Arc<AtomicFlag>,
    handle: Option<JoinHandle<Pools>>,
}

impl ClockThread {
    pub(crate) fn spawn(
        name: &str,
        period: Duration,
        mut pools: Pools,
        control: ClockControl,
        mut callback: Box<dyn PeriodCallback>,
    ) -> Result<Self, DriverError> {
        let shutdown = Arc::new(AtomicFlag::new(false));
        let flag = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let _ = thread_priority::set_current_thread_priority(ThreadPriority::Max);
                run_clock(&flag, period, &mut pools, &control, callback.as_mut());
                pools
            })
            .map_err(|_| DriverError::Unknown)?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Stop the clock and take the pools back. Blocks until the thread exits.
    pub(crate) fn stop(&mut self) -> Option<Pools> {
        self.shutdown.set(true);
        self.handle.take().and_then(|h| h.join().ok())
    }
}

impl Drop for ClockThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_clock(
    shutdown: &AtomicFlag,
    period: Duration,
    pools: &mut Pools,
    control: &ClockControl,
    callback: &mut dyn PeriodCallback,
) {
    let frames = pools.output.period_size().max(pools.input.period_size());
    let idle = period.min(Duration::from_millis(2));
    let mut next = Instant::now();

    while !shutdown.get() {
        if control.is_halted() {
            thread::sleep(idle);
            next = Instant::now();
            continue;
        }

        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else if now - next > period * 4 {
            // Fell far behind (suspended process); resync instead of bursting.
            next = now;
        }
        next += period;

        let hardware_xrun = control.take_xrun();
        let Pools { input, output } = pools;
        let mut io = PeriodIo {
            input: input.lease(frames),
            output: output.lease(frames),
            frames,
            hardware_xrun,
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            callback.process(&mut io);
        }));
        if result.is_err() {
            tracing::error!("period callback panicked on the clock thread");
            io.output.silence();
            control.shared.panics.fetch_add(1, Ordering::AcqRel);
        }
        drop(io);

        control.shared.cycles.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolStats;

    #[test]
    fn test_take_xrun_counts_down() {
        let control = ClockControl::new();
        assert!(!control.take_xrun());
        control.inject_xruns(2);
        assert!(control.take_xrun());
        assert!(control.take_xrun());
        assert!(!control.take_xrun());
    }

    #[test]
    fn test_clock_invokes_callback_and_returns_pools() {
        let stats = PoolStats::new();
        let pools = Pools {
            input: BufferPool::new(0, 64, 2, Arc::clone(&stats)),
            output: BufferPool::new(2, 64, 2, Arc::clone(&stats)),
        };
        let control = ClockControl::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);

        let mut clock = ClockThread::spawn(
            "clock-test",
            Duration::from_millis(1),
            pools,
            control.clone(),
            Box::new(move |io: &mut PeriodIo<'_>| {
                assert_eq!(io.frames, 64);
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while control.cycles() < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        let pools = clock.stop().unwrap();
        let after_stop = calls.load(Ordering::Relaxed);
        assert!(after_stop >= 5);

        thread::sleep(Duration::from_millis(10));
        assert_eq!(calls.load(Ordering::Relaxed), after_stop);
        assert_eq!(stats.leased(), 0);
        drop(pools);
        assert!(stats.is_idle());
    }

    #[test]
    fn test_panicking_callback_is_silenced_and_counted() {
        let stats = PoolStats::new();
        let pools = Pools {
            input: BufferPool::new(0, 64, 2, Arc::clone(&stats)),
            output: BufferPool::new(2, 64, 2, Arc::clone(&stats)),
        };
        let control = ClockControl::new();

        let mut clock = ClockThread::spawn(
            "clock-panic",
            Duration::from_millis(1),
            pools,
            control.clone(),
            Box::new(|io: &mut PeriodIo<'_>| {
                io.output.channel_mut(0).fill(1.0);
                panic!("mixer bug");
            }),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while control.cycles() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(clock.stop().is_some());
        assert!(control.cycles() >= 3);
        assert_eq!(control.panics(), control.cycles());
        assert_eq!(stats.leased(), 0);
    }
}
