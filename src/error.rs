//! Crate-wide error types.
//!
//! Nothing here is fatal to the process: a wedged or failing device surfaces
//! as a terminal session event and never halts monitoring or flashing of
//! other devices.

use serde::Serialize;
use thiserror::Error;

use crate::engine::Stage;
use crate::transport::DeviceId;

/// Errors surfaced by the device/session core.
#[derive(Debug, Clone, Error, Serialize)]
pub enum Error {
    /// The device is already claimed by an active session.
    #[error("device {0} is busy")]
    DeviceBusy(DeviceId),

    /// The identity is not (or no longer) present in the registry.
    #[error("no such device: {0}")]
    NoSuchDevice(DeviceId),

    /// A stage spent its whole retry budget on transient failures.
    #[error("stage {stage} exhausted its retry budget after {attempts} attempt(s): {last_error}")]
    StageExhausted {
        stage: Stage,
        attempts: u32,
        last_error: String,
    },

    /// Unrecoverable failure; the target may need manual recovery.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The device detached while a session was active.
    #[error("device disconnected during session")]
    Disconnected,
}

impl Error {
    /// True for outcomes that leave the target in a state that may need
    /// manual recovery (flagged prominently to the operator).
    pub fn needs_attention(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

/// Convenient Result type for core operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Stage;

    #[test]
    fn only_fatal_outcomes_need_attention() {
        assert!(Error::Fatal("write timed out".into()).needs_attention());
        assert!(!Error::Disconnected.needs_attention());
        assert!(!Error::StageExhausted {
            stage: Stage::Erase,
            attempts: 2,
            last_error: "flash busy".into(),
        }
        .needs_attention());
        assert!(!Error::DeviceBusy("0403:6014/X".into()).needs_attention());
    }
}
