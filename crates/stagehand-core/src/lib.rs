//! Real-time audio I/O core: driver backends, buffer pool, command relay and
//! the audio device manager.
//!
//! # Primary API
//!
//! - [`DeviceManager`] / [`DeviceManagerBuilder`]: owns the active backend,
//!   handles driver selection, fallback and the stall watchdog
//! - [`Driver`]: closed set of backends (CPAL hosts, Dummy, Null)
//! - [`BufferPool`]: pre-allocated per-period sample storage
//! - [`relay::channel`]: lock-free SPSC queues between control and audio threads
//! - [`StatusEvent`]: fixed-size notifications from the audio side
//!
//! # Feature-gated APIs
//!
//! - `"hardware"`: ALSA / platform default host via CPAL (enabled by default)
//! - `"jack"`: JACK host via CPAL
//!
//! # Example
//!
//! ```ignore
//! use stagehand_core::prelude::*;
//!
//! let manager = DeviceManager::builder()
//!     .config(DeviceConfig::default())
//!     .preferences(vec![BackendKind::Alsa])
//!     .start(Box::new(my_callback))?;
//!
//! println!("latency: {:.1} ms", manager.session().map_or(0.0, |s| s.latency_ms()));
//! ```

pub mod error;
pub use error::{DriverError, Error, Result};

pub mod config;
pub use config::{BackendKind, DeviceConfig, DuplexMode, SampleRate, WatchdogConfig};

pub mod event;
pub use event::{AckToken, FallbackReason, Severity, StatusEvent, StreamTag};

pub mod relay;
pub use relay::{QueueFull, RelayReceiver, RelaySender, StatusSender};

mod pool;
pub use pool::{BufferPool, PeriodBuffer, PoolStats};

pub mod driver;
pub use driver::{
    available_backends, list_devices, Bus, ClockControl, DeviceSession, Driver, DummyBehavior,
    DummyDriver, NullDriver, PeriodCallback, PeriodIo,
};

mod device;
pub use device::{DeviceManager, DeviceManagerBuilder, DeviceState, XrunMonitor, NO_DEVICE_NAME};

mod metering;
pub use metering::{CpuMeter, CpuMetrics};

mod lockfree;
pub use lockfree::{AtomicFlag, AtomicFloat};

pub use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
pub use std::sync::Arc;

/// Convenience re-exports for embedding the core.
pub mod prelude {
    pub use crate::{
        BackendKind, DeviceConfig, DeviceManager, DeviceSession, DeviceState, DuplexMode,
        PeriodCallback, PeriodIo, SampleRate, Severity, StatusEvent, WatchdogConfig,
    };
}
