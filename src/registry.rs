//! Device registry.
//!
//! Tracks currently known programmer adapters and arbitrates session claims.
//! The registry is the single owner of claim state: `try_claim` is atomic per
//! device, so two concurrent starts on one identity yield exactly one
//! winner. Claim arbitration is a per-entry lock, not a registry-wide one;
//! unrelated devices proceed independently.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;

use crate::error::Error;
use crate::transport::{DeviceId, UsbDeviceInfo};

/// One known device.
#[derive(Debug)]
pub struct DeviceEntry {
    pub id: DeviceId,
    pub info: UsbDeviceInfo,
    pub discovered_at: OffsetDateTime,
    claimed: Mutex<bool>,
}

impl DeviceEntry {
    pub fn is_claimed(&self) -> bool {
        *self.claimed.lock()
    }
}

/// Shared device table. Cheap to clone; all clones see the same table.
#[derive(Clone, Default)]
pub struct Registry {
    devices: Arc<RwLock<HashMap<DeviceId, Arc<DeviceEntry>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device, returning the existing entry if already known.
    pub fn register(&self, info: UsbDeviceInfo) -> Arc<DeviceEntry> {
        let id = info.id();
        let mut devices = self.devices.write();
        devices
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(DeviceEntry {
                    id,
                    info,
                    discovered_at: OffsetDateTime::now_utc(),
                    claimed: Mutex::new(false),
                })
            })
            .clone()
    }

    /// Remove a device. Silent on unknown identities, since detach races
    /// with flash completion are expected.
    pub fn unregister(&self, id: &DeviceId) -> Option<Arc<DeviceEntry>> {
        self.devices.write().remove(id)
    }

    pub fn get(&self, id: &DeviceId) -> Option<Arc<DeviceEntry>> {
        self.devices.read().get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<DeviceEntry>> {
        self.devices.read().values().cloned().collect()
    }

    /// Atomically claim a device for a session.
    pub fn try_claim(&self, id: &DeviceId) -> Result<Arc<DeviceEntry>, Error> {
        let entry = self
            .get(id)
            .ok_or_else(|| Error::NoSuchDevice(id.clone()))?;
        let mut claimed = entry.claimed.lock();
        if *claimed {
            return Err(Error::DeviceBusy(id.clone()));
        }
        *claimed = true;
        drop(claimed);
        Ok(entry)
    }

    /// Release a claim. Silent on unknown identities: the entry may already
    /// be gone if the device detached mid-session.
    pub fn release(&self, id: &DeviceId) {
        if let Some(entry) = self.get(id) {
            *entry.claimed.lock() = false;
        }
    }
}
