//! Device management: driver selection, fallback and the watchdog.

mod manager;
mod monitor;
mod watchdog;

pub use manager::{DeviceManager, DeviceManagerBuilder, DeviceState, NO_DEVICE_NAME};
pub use monitor::XrunMonitor;
