//! Scriptable in-memory transport for tests.
//!
//! Devices are attached and detached through a shared handle; enumeration
//! failures can be injected to exercise the watcher's backoff and
//! degraded-health paths.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{DeviceId, Transport, TransportError, UsbDeviceInfo};

#[derive(Default)]
struct State {
    devices: BTreeMap<DeviceId, UsbDeviceInfo>,
    /// Number of upcoming enumerate() calls that should fail.
    fail_next: u32,
    scans: u64,
}

/// In-memory transport whose device set is controlled by the test.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a device in; it appears in the next scan.
    pub fn attach(&self, info: UsbDeviceInfo) {
        let mut state = self.state.lock();
        state.devices.insert(info.id(), info);
    }

    /// Pull a device out; it vanishes from the next scan.
    pub fn detach(&self, id: &DeviceId) {
        self.state.lock().devices.remove(id);
    }

    /// Make the next `n` scans fail with an enumeration error.
    pub fn fail_scans(&self, n: u32) {
        self.state.lock().fail_next = n;
    }

    /// How many scans have been attempted so far.
    pub fn scan_count(&self) -> u64 {
        self.state.lock().scans
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn enumerate(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        let mut state = self.state.lock();
        state.scans += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Enumeration("injected failure".into()));
        }
        Ok(state.devices.values().cloned().collect())
    }
}

/// A plausible FT232H adapter for tests.
pub fn ft232h(serial: &str) -> UsbDeviceInfo {
    UsbDeviceInfo {
        vid: 0x0403,
        pid: 0x6014,
        serial_number: Some(serial.to_string()),
        device_path: format!("/sys/bus/usb/devices/1-1.{serial}"),
        serial_ports: vec!["/dev/ttyUSB0".to_string()],
    }
}
