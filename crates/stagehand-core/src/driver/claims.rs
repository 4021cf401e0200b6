//! Process-wide exclusive device claims.

use crate::error::DriverError;
use dashmap::DashSet;
use std::sync::OnceLock;

fn claims() -> &'static DashSet<String> {
    static CLAIMS: OnceLock<DashSet<String>> = OnceLock::new();
    CLAIMS.get_or_init(DashSet::new)
}

/// Exclusive hold on a device id. Released on drop.
#[derive(Debug)]
pub(crate) struct DeviceClaim {
    device_id: String,
}

impl DeviceClaim {
    pub(crate) fn acquire(device_id: &str) -> Result<Self, DriverError> {
        if claims().insert(device_id.to_string()) {
            Ok(Self {
                device_id: device_id.to_string(),
            })
        } else {
            Err(DriverError::DeviceBusy)
        }
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        claims().remove(&self.device_id);
    }
}
