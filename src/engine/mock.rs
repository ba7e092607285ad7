//! Scriptable flash engine for tests and dry runs.
//!
//! Each stage call pops the next scripted outcome for that stage (default:
//! immediate success). Scripts can emit progress reports, hold the stage for
//! a while, or park until cancelled, which is enough to exercise every
//! retry, timeout, and cancellation path in the session runner.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{EngineError, FlashEngine, FlashHandle, Progress, ProgressSink, Stage, StageResult};
use crate::image::FirmwareImage;

/// One scripted stage outcome.
pub struct StageScript {
    /// Progress reports emitted before the hold.
    pub progress: Vec<Progress>,
    /// How long the stage runs before returning.
    pub hold: Duration,
    /// Park until the cancel token fires instead of holding for a duration;
    /// models an engine waiting at an atomic-unit boundary.
    pub until_cancelled: bool,
    pub result: StageResult,
}

impl StageScript {
    pub fn ok() -> Self {
        Self {
            progress: Vec::new(),
            hold: Duration::ZERO,
            until_cancelled: false,
            result: StageResult::Success,
        }
    }

    pub fn transient(error: &str) -> Self {
        Self {
            result: StageResult::Transient(error.to_string()),
            ..Self::ok()
        }
    }

    pub fn fatal(error: &str) -> Self {
        Self {
            result: StageResult::Fatal(error.to_string()),
            ..Self::ok()
        }
    }

    /// Never returns on its own; observes the token and reports Cancelled.
    pub fn cooperative_park() -> Self {
        Self {
            until_cancelled: true,
            ..Self::ok()
        }
    }

    /// Runs longer than any reasonable timeout without observing cancel.
    pub fn hang(hold: Duration) -> Self {
        Self {
            hold,
            ..Self::ok()
        }
    }

    pub fn with_progress(mut self, bytes_done: u64, bytes_total: u64) -> Self {
        self.progress.push(Progress {
            bytes_done,
            bytes_total,
        });
        self
    }
}

#[derive(Default)]
struct State {
    scripts: HashMap<Stage, VecDeque<StageScript>>,
    calls: Vec<Stage>,
    fail_opens: u32,
    opens: u32,
    closes: u32,
}

/// Shared scriptable engine.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<State>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next call of `stage`.
    pub fn script(&self, stage: Stage, script: StageScript) {
        self.state
            .lock()
            .scripts
            .entry(stage)
            .or_default()
            .push_back(script);
    }

    /// Make the next `n` open() calls fail.
    pub fn fail_opens(&self, n: u32) {
        self.state.lock().fail_opens = n;
    }

    /// Every run_stage call so far, in order.
    pub fn calls(&self) -> Vec<Stage> {
        self.state.lock().calls.clone()
    }

    pub fn opens(&self) -> u32 {
        self.state.lock().opens
    }

    pub fn closes(&self) -> u32 {
        self.state.lock().closes
    }
}

#[async_trait::async_trait]
impl FlashEngine for MockEngine {
    async fn open(&self, port: &str) -> Result<Box<dyn FlashHandle>, EngineError> {
        let mut state = self.state.lock();
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(EngineError::Open {
                port: port.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "injected"),
            });
        }
        state.opens += 1;
        drop(state);
        Ok(Box::new(MockHandle {
            state: self.state.clone(),
        }))
    }
}

struct MockHandle {
    state: Arc<Mutex<State>>,
}

#[async_trait::async_trait]
impl FlashHandle for MockHandle {
    async fn run_stage(
        &mut self,
        stage: Stage,
        _image: &FirmwareImage,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> StageResult {
        let script = {
            let mut state = self.state.lock();
            state.calls.push(stage);
            state
                .scripts
                .get_mut(&stage)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(StageScript::ok)
        };

        for report in &script.progress {
            let _ = progress.try_send(*report);
        }

        if script.until_cancelled {
            cancel.cancelled().await;
            return StageResult::Cancelled;
        }
        if !script.hold.is_zero() {
            tokio::time::sleep(script.hold).await;
        }
        script.result
    }

    async fn close(self: Box<Self>) {
        self.state.lock().closes += 1;
    }
}
