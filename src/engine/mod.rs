//! Flash engine boundary.
//!
//! The engine owns the byte-level chip-programming protocol. The core hands
//! it an opened port and a firmware image and consumes only the narrow
//! open / run_stage / close contract; per-stage timeouts are enforced by the
//! session runner around `run_stage`, not by the engine.

pub mod esptool;
pub mod mock;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::image::FirmwareImage;

/// One ordered step of the flashing protocol.
///
/// Verification is a distinct stage ordered before the final reset; there is
/// no separate post-reset confirmation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    Connect,
    UploadStub,
    Erase,
    Write,
    Verify,
    Reset,
}

impl Stage {
    /// The full sequence, in execution order.
    pub const SEQUENCE: [Stage; 6] = [
        Stage::Connect,
        Stage::UploadStub,
        Stage::Erase,
        Stage::Write,
        Stage::Verify,
        Stage::Reset,
    ];

    pub fn next(self) -> Option<Stage> {
        let idx = Stage::SEQUENCE.iter().position(|s| *s == self)?;
        Stage::SEQUENCE.get(idx + 1).copied()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Connect => "connect",
            Stage::UploadStub => "upload-stub",
            Stage::Erase => "erase",
            Stage::Write => "write",
            Stage::Verify => "verify",
            Stage::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Engine-reported errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to open port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine process error: {0}")]
    Process(#[from] std::io::Error),

    #[error("{0}")]
    Stage(String),
}

/// Outcome of one stage attempt.
#[derive(Debug)]
pub enum StageResult {
    /// Stage completed; the session may advance.
    Success,
    /// Recoverable failure; retry within the stage's budget.
    Transient(String),
    /// Unrecoverable failure (bad checksum, unsupported chip, ...); fail the
    /// session immediately, no retry.
    Fatal(String),
    /// The engine observed the cancellation token at an atomic-unit boundary
    /// and stopped cleanly.
    Cancelled,
}

/// Progress report emitted by an engine during a stage.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub bytes_done: u64,
    pub bytes_total: u64,
}

/// Channel the engine reports stage progress on. Reports are best-effort;
/// engines use try_send and never block on a slow consumer.
pub type ProgressSink = mpsc::Sender<Progress>;

/// Factory side of the engine: opens a port for a session.
#[async_trait::async_trait]
pub trait FlashEngine: Send + Sync + 'static {
    async fn open(&self, port: &str) -> Result<Box<dyn FlashHandle>, EngineError>;
}

/// One opened port, exclusively owned by a session for its lifetime.
#[async_trait::async_trait]
pub trait FlashHandle: Send {
    /// Execute one stage against the device.
    ///
    /// The engine must observe `cancel` only at boundaries where stopping
    /// leaves flash memory consistent (between pages/sectors within Write),
    /// returning `StageResult::Cancelled` when it does.
    async fn run_stage(
        &mut self,
        stage: Stage,
        image: &FirmwareImage,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> StageResult;

    /// Release the port.
    async fn close(self: Box<Self>);
}
