//! Physical transport layer for programmer adapters.
//!
//! This module handles discovery of USB programmer adapters. It provides raw
//! device information without any knowledge of what will be flashed onto the
//! targets behind them; that knowledge belongs to the flash engine.

#[cfg(target_os = "linux")]
pub mod linux;
pub mod mock;

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Stable identity for a programmer adapter.
///
/// Derived from the USB vendor/product ids plus the adapter serial number,
/// falling back to the device path for adapters with no serial programmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

/// Information about a discovered USB device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsbDeviceInfo {
    /// USB vendor ID
    pub vid: u16,
    /// USB product ID
    pub pid: u16,
    /// Device serial number (if programmed)
    pub serial_number: Option<String>,
    /// USB device path (e.g., "/sys/bus/usb/devices/1-1.2")
    pub device_path: String,
    /// Serial port device nodes associated with this device
    /// (e.g., ["/dev/ttyUSB0"])
    pub serial_ports: Vec<String>,
}

impl UsbDeviceInfo {
    /// Stable identity for this device.
    pub fn id(&self) -> DeviceId {
        match &self.serial_number {
            Some(serial) => DeviceId(format!("{:04x}:{:04x}/{}", self.vid, self.pid, serial)),
            None => DeviceId(format!(
                "{:04x}:{:04x}@{}",
                self.vid, self.pid, self.device_path
            )),
        }
    }

    /// Primary port node the flash engine should open, if one was found.
    pub fn primary_port(&self) -> Option<&str> {
        self.serial_ports.first().map(String::as_str)
    }
}

/// Transport layer error types.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("enumeration failed: {0}")]
    Enumeration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device enumeration source.
///
/// Implementations report every matching-class device currently present; the
/// watcher diffs successive scans to synthesize attach/detach notifications,
/// so a scan after an error loses nothing (reconciliation on every tick).
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Enumerate currently present devices.
    async fn enumerate(&self) -> Result<Vec<UsbDeviceInfo>, TransportError>;
}
