//! Daemon configuration.
//!
//! Everything is defaulted so `flashd` runs with no config file at all; a
//! TOML file overrides individual fields. Durations are plain milliseconds
//! to keep the file format boring.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::Stage;

/// USB vendor/product signature of the programmer adapter class.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UsbSignature {
    pub vid: u16,
    pub pid: u16,
}

impl UsbSignature {
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

impl Default for UsbSignature {
    /// FT232H in UART mode.
    fn default() -> Self {
        Self {
            vid: 0x0403,
            pid: 0x6014,
        }
    }
}

/// Retry budget and timeout for one stage.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StagePolicy {
    /// Total attempts, including the first (minimum 1).
    pub attempts: u32,
    pub timeout_ms: u64,
}

impl StagePolicy {
    pub const fn new(attempts: u32, timeout_ms: u64) -> Self {
        Self {
            attempts,
            timeout_ms,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Per-stage policy table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagePolicies {
    pub connect: StagePolicy,
    pub upload_stub: StagePolicy,
    pub erase: StagePolicy,
    pub write: StagePolicy,
    pub verify: StagePolicy,
    pub reset: StagePolicy,
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            connect: StagePolicy::new(3, 5_000),
            upload_stub: StagePolicy::new(3, 5_000),
            erase: StagePolicy::new(2, 15_000),
            // A partial write restarts from Erase, never resumes; no
            // automatic retry.
            write: StagePolicy::new(1, 30_000),
            verify: StagePolicy::new(2, 5_000),
            reset: StagePolicy::new(2, 5_000),
        }
    }
}

impl StagePolicies {
    pub fn policy(&self, stage: Stage) -> StagePolicy {
        match stage {
            Stage::Connect => self.connect,
            Stage::UploadStub => self.upload_stub,
            Stage::Erase => self.erase,
            Stage::Write => self.write,
            Stage::Verify => self.verify,
            Stage::Reset => self.reset,
        }
    }
}

/// Watcher polling and failure handling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Reconciliation scan interval.
    pub poll_interval_ms: u64,
    /// Backoff after a failed scan starts here...
    pub backoff_base_ms: u64,
    /// ...and doubles up to this cap.
    pub backoff_cap_ms: u64,
    /// Consecutive scan failures before TransportDegraded is raised.
    pub degraded_after: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            backoff_base_ms: 500,
            backoff_cap_ms: 10_000,
            degraded_after: 3,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

/// esptool engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EsptoolConfig {
    pub command: String,
    pub chip: String,
    pub baud: u32,
}

impl Default for EsptoolConfig {
    fn default() -> Self {
        Self {
            command: "esptool".to_string(),
            chip: "esp32s3".to_string(),
            baud: 921_600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signature: UsbSignature,
    pub watcher: WatcherConfig,
    pub stages: StagePolicies,
    pub esptool: EsptoolConfig,
    /// Ring-buffer depth per event subscriber.
    pub event_buffer: usize,
    /// Fixed settle delay between stage retries.
    pub retry_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signature: UsbSignature::default(),
            watcher: WatcherConfig::default(),
            stages: StagePolicies::default(),
            esptool: EsptoolConfig::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            retry_backoff_ms: 1_000,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Event buffer depth, with the default applied when the field was
    /// zeroed or left out of a hand-written file.
    pub fn event_buffer_depth(&self) -> usize {
        if self.event_buffer == 0 {
            DEFAULT_EVENT_BUFFER
        } else {
            self.event_buffer
        }
    }
}

pub const DEFAULT_EVENT_BUFFER: usize = 256;
