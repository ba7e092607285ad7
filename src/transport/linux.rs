//! Sysfs-based USB enumeration for Linux.
//!
//! Walks /sys/bus/usb/devices, reading the idVendor/idProduct/serial
//! attribute files of each device, and collects the ttyUSB nodes that hang
//! off an interface of the device. Filtering to the programmer signature is
//! the watcher's job; this layer reports everything it can parse.

use std::fs;
use std::path::Path;

use super::{Transport, TransportError, UsbDeviceInfo};

const SYSFS_USB: &str = "/sys/bus/usb/devices";

/// Enumerator backed by the sysfs USB device tree.
pub struct SysfsTransport {
    root: String,
}

impl SysfsTransport {
    pub fn new() -> Self {
        Self {
            root: SYSFS_USB.to_string(),
        }
    }

    /// Scan a different tree root. Used by tests against a fixture tree.
    pub fn with_root(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    fn read_attr(dir: &Path, name: &str) -> Option<String> {
        let raw = fs::read_to_string(dir.join(name)).ok()?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn read_device(dir: &Path) -> Option<UsbDeviceInfo> {
        let vid = u16::from_str_radix(&Self::read_attr(dir, "idVendor")?, 16).ok()?;
        let pid = u16::from_str_radix(&Self::read_attr(dir, "idProduct")?, 16).ok()?;
        Some(UsbDeviceInfo {
            vid,
            pid,
            serial_number: Self::read_attr(dir, "serial"),
            device_path: dir.to_string_lossy().into_owned(),
            serial_ports: Self::find_tty_nodes(dir),
        })
    }

    /// A tty node shows up as <dev>:<config.iface>/ttyUSBn/; the matching
    /// /dev node carries the same name.
    fn find_tty_nodes(dir: &Path) -> Vec<String> {
        let mut ports = Vec::new();
        let Ok(entries) = fs::read_dir(dir) else {
            return ports;
        };
        for iface in entries.flatten() {
            if !iface.file_name().to_string_lossy().contains(':') {
                continue;
            }
            let Ok(children) = fs::read_dir(iface.path()) else {
                continue;
            };
            for child in children.flatten() {
                let name = child.file_name().to_string_lossy().into_owned();
                if name.starts_with("ttyUSB") || name.starts_with("ttyACM") {
                    ports.push(format!("/dev/{name}"));
                }
            }
        }
        ports.sort();
        ports
    }
}

impl Default for SysfsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for SysfsTransport {
    async fn enumerate(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        // Attribute files are a handful of bytes; sync reads are fine here.
        let entries = fs::read_dir(&self.root)
            .map_err(|e| TransportError::Enumeration(format!("{}: {e}", self.root)))?;

        let mut devices = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Skip interface entries (1-1.2:1.0) and root hubs (usb1).
            if name.contains(':') || name.starts_with("usb") {
                continue;
            }
            if let Some(info) = Self::read_device(&entry.path()) {
                devices.push(info);
            }
        }
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_device(root: &Path, name: &str, vid: &str, pid: &str, serial: Option<&str>) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("idVendor"), format!("{vid}\n")).unwrap();
        fs::write(dir.join("idProduct"), format!("{pid}\n")).unwrap();
        if let Some(s) = serial {
            fs::write(dir.join("serial"), format!("{s}\n")).unwrap();
        }
        fs::create_dir_all(dir.join("1-1:1.0/ttyUSB0")).unwrap();
    }

    #[tokio::test]
    async fn scans_fixture_tree() {
        let tmp = tempfile::tempdir().unwrap();
        write_device(tmp.path(), "1-1", "0403", "6014", Some("FT000001"));
        write_device(tmp.path(), "1-2", "1d6b", "0002", None);
        // Interface and hub entries must be skipped, not parsed.
        fs::create_dir_all(tmp.path().join("1-1:1.0")).unwrap();
        fs::create_dir_all(tmp.path().join("usb1")).unwrap();

        let transport = SysfsTransport::with_root(tmp.path().to_string_lossy());
        let mut devices = transport.enumerate().await.unwrap();
        devices.sort_by_key(|d| d.vid);

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].vid, 0x0403);
        assert_eq!(devices[0].serial_number.as_deref(), Some("FT000001"));
        assert_eq!(devices[0].serial_ports, vec!["/dev/ttyUSB0".to_string()]);
    }

    #[tokio::test]
    async fn missing_root_is_an_enumeration_error() {
        let transport = SysfsTransport::with_root("/nonexistent/sysfs");
        assert!(matches!(
            transport.enumerate().await,
            Err(TransportError::Enumeration(_))
        ));
    }
}
