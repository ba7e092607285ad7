//! Flash sessions.
//!
//! A session is the exclusive claim of one device plus the task driving it
//! through the stage sequence. Session state (current stage, attempt
//! counter, start time) lives inside the runner task; the rest of the system
//! interacts with a session only through its [`SessionControl`] and the
//! events it emits.

pub mod manager;
mod runner;

pub use manager::SessionManager;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Why a session is being asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    /// Operator cancel; terminal event is SessionCancelled.
    UserCancel,
    /// Device detached; terminal event is SessionFailed(Disconnected).
    Disconnected,
}

/// Cooperative stop handle for one session.
///
/// The cause is recorded before the token fires so the runner can tell a
/// cancel from a detach when it reaches the next safe checkpoint. The first
/// recorded cause wins; a detach arriving after an operator cancel does not
/// rewrite history.
#[derive(Debug)]
pub struct SessionControl {
    cancel: CancellationToken,
    cause: Mutex<Option<AbortCause>>,
}

impl SessionControl {
    /// Create a control whose token is a child of `parent`, so daemon
    /// shutdown cancels every session.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            cause: Mutex::new(None),
        }
    }

    /// Request a stop for the given cause.
    pub fn abort(&self, cause: AbortCause) {
        let mut slot = self.cause.lock();
        if slot.is_none() {
            *slot = Some(cause);
        }
        drop(slot);
        self.cancel.cancel();
    }

    /// The token the runner and engine watch.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cause of the stop. Daemon shutdown cancels the parent token without
    /// recording a cause; that reads as an operator cancel.
    pub fn cause(&self) -> AbortCause {
        self.cause.lock().unwrap_or(AbortCause::UserCancel)
    }
}
