//! Status events delivered to the operator front end.
//!
//! Events are immutable and append-only. Within a single device they are
//! delivered in emission order; no ordering is guaranteed between devices.

use serde::Serialize;
use time::OffsetDateTime;

use crate::engine::Stage;
use crate::error::Error;
use crate::transport::{DeviceId, UsbDeviceInfo};

/// One record on the status feed.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Bus-assigned sequence number, strictly increasing per bus.
    pub seq: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Absent for system-level health events.
    pub device: Option<DeviceId>,
    pub kind: EventKind,
}

impl Event {
    /// Terminal session outcomes are never dropped by the bus.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::SessionDone { .. }
                | EventKind::SessionFailed { .. }
                | EventKind::SessionCancelled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum EventKind {
    /// A matching adapter appeared.
    Attached { info: UsbDeviceInfo },
    /// The adapter went away.
    Detached,
    /// A session claimed the device and will begin flashing.
    SessionStarted { image_bytes: u64 },
    StageStarted {
        stage: Stage,
        attempt: u32,
    },
    StageProgress {
        stage: Stage,
        bytes_done: u64,
        bytes_total: u64,
    },
    /// A stage attempt failed; `will_retry` tells the operator whether the
    /// session is still alive.
    StageFailed {
        stage: Stage,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    SessionDone {
        elapsed_ms: u64,
    },
    SessionFailed {
        error: Error,
    },
    SessionCancelled,
    /// A front-end command could not be honored (stale identity, device
    /// already claimed, bad image path).
    CommandRejected { error: Error },
    /// Enumeration has been failing persistently; device state may be stale.
    TransportDegraded { error: String },
    /// Enumeration works again.
    TransportRecovered,
}
