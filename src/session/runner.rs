//! The per-session stage driver.
//!
//! One runner task exists per claimed device. It walks the stage sequence in
//! order, applying the per-stage retry budget and timeout, forwards engine
//! progress to the bus, and ends in exactly one terminal event. Transient
//! stage errors never leave this module.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::bus::EventBus;
use crate::config::{Config, StagePolicy};
use crate::engine::{FlashEngine, FlashHandle, Progress, Stage, StageResult};
use crate::error::Error;
use crate::event::EventKind;
use crate::image::FirmwareImage;
use crate::registry::Registry;
use crate::session::{AbortCause, SessionControl};
use crate::transport::DeviceId;

pub(crate) struct SessionCtx {
    pub id: DeviceId,
    pub port: String,
    pub image: FirmwareImage,
    pub engine: Arc<dyn FlashEngine>,
    pub config: Arc<Config>,
    pub bus: EventBus,
    pub registry: Registry,
    pub control: Arc<SessionControl>,
}

enum Terminal {
    Done,
    /// Stopped at a safe checkpoint; cause distinguishes cancel from detach.
    Aborted,
    Failed(Error),
}

enum Attempt {
    Success,
    Transient(String),
    Fatal(String),
    Cancelled,
}

/// Drive one session to its terminal event, then release the claim.
pub(crate) async fn run(ctx: SessionCtx) {
    let started = Instant::now();
    tracing::info!(device = %ctx.id, port = %ctx.port, "session starting");

    let terminal = drive(&ctx).await;

    let kind = match terminal {
        Terminal::Done => {
            tracing::info!(device = %ctx.id, "session done");
            EventKind::SessionDone {
                elapsed_ms: started.elapsed().as_millis() as u64,
            }
        }
        Terminal::Aborted => match ctx.control.cause() {
            AbortCause::UserCancel => {
                tracing::info!(device = %ctx.id, "session cancelled");
                EventKind::SessionCancelled
            }
            AbortCause::Disconnected => {
                tracing::warn!(device = %ctx.id, "device disconnected during session");
                EventKind::SessionFailed {
                    error: Error::Disconnected,
                }
            }
        },
        Terminal::Failed(error) => {
            if error.needs_attention() {
                tracing::error!(device = %ctx.id, %error, "session failed, target may need manual recovery");
            } else {
                tracing::warn!(device = %ctx.id, %error, "session failed");
            }
            EventKind::SessionFailed { error }
        }
    };

    ctx.registry.release(&ctx.id);
    ctx.bus.publish(Some(ctx.id.clone()), kind);
}

async fn drive(ctx: &SessionCtx) -> Terminal {
    let mut handle: Option<Box<dyn FlashHandle>> = None;

    for stage in Stage::SEQUENCE {
        let policy = ctx.config.stages.policy(stage);
        let mut attempt = 1u32;

        loop {
            // Stage boundary: the cancel checkpoint.
            if ctx.control.token().is_cancelled() {
                close(handle).await;
                return Terminal::Aborted;
            }

            ctx.bus
                .publish(Some(ctx.id.clone()), EventKind::StageStarted { stage, attempt });

            // The port is (re)opened lazily; an open failure is a transient
            // failure of the stage that needed it.
            let outcome = match ensure_open(ctx, &mut handle).await {
                Err(open_err) => Attempt::Transient(open_err),
                Ok(()) => {
                    let h = handle.as_mut().expect("ensure_open filled the handle");
                    run_attempt(ctx, h, stage, policy).await
                }
            };

            match outcome {
                Attempt::Success => break,
                Attempt::Cancelled => {
                    close(handle).await;
                    return Terminal::Aborted;
                }
                Attempt::Fatal(error) => {
                    ctx.bus.publish(
                        Some(ctx.id.clone()),
                        EventKind::StageFailed {
                            stage,
                            attempt,
                            error: error.clone(),
                            will_retry: false,
                        },
                    );
                    close(handle).await;
                    return Terminal::Failed(Error::Fatal(error));
                }
                Attempt::Transient(error) => {
                    let will_retry = attempt < policy.attempts;
                    tracing::debug!(
                        device = %ctx.id, %stage, attempt, %error, will_retry,
                        "stage attempt failed"
                    );
                    ctx.bus.publish(
                        Some(ctx.id.clone()),
                        EventKind::StageFailed {
                            stage,
                            attempt,
                            error: error.clone(),
                            will_retry,
                        },
                    );
                    if !will_retry {
                        close(handle).await;
                        return Terminal::Failed(Error::StageExhausted {
                            stage,
                            attempts: policy.attempts,
                            last_error: error,
                        });
                    }
                    // Connect retries start from a fresh port.
                    if stage == Stage::Connect {
                        close(handle.take()).await;
                    }
                    attempt += 1;

                    // Settle delay before the retry, still cancellable.
                    tokio::select! {
                        _ = tokio::time::sleep(ctx.config.retry_backoff()) => {}
                        _ = ctx.control.token().cancelled() => {
                            close(handle).await;
                            return Terminal::Aborted;
                        }
                    }
                }
            }
        }
    }

    close(handle).await;
    Terminal::Done
}

/// One timed attempt of one stage, forwarding progress to the bus.
///
/// A timeout is a transient failure, except a Write that already reported
/// progress: past that point the flash contents cannot be trusted for a
/// resume, so the timeout is fatal and only a fresh erase+write recovers.
async fn run_attempt(
    ctx: &SessionCtx,
    handle: &mut Box<dyn FlashHandle>,
    stage: Stage,
    policy: StagePolicy,
) -> Attempt {
    let (progress_tx, mut progress_rx) = mpsc::channel::<Progress>(16);
    let mut wrote_anything = false;

    let fut = handle.run_stage(stage, &ctx.image, &progress_tx, ctx.control.token());
    tokio::pin!(fut);
    let timeout = tokio::time::sleep(policy.timeout());
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            result = &mut fut => {
                return match result {
                    StageResult::Success => Attempt::Success,
                    StageResult::Transient(e) => Attempt::Transient(e),
                    StageResult::Fatal(e) => Attempt::Fatal(e),
                    StageResult::Cancelled => Attempt::Cancelled,
                };
            }
            Some(p) = progress_rx.recv() => {
                if p.bytes_done > 0 {
                    wrote_anything = true;
                }
                ctx.bus.publish(
                    Some(ctx.id.clone()),
                    EventKind::StageProgress {
                        stage,
                        bytes_done: p.bytes_done,
                        bytes_total: p.bytes_total,
                    },
                );
            }
            _ = &mut timeout => {
                return if stage == Stage::Write && wrote_anything {
                    Attempt::Fatal(format!(
                        "write timed out after {}ms past the point of no return",
                        policy.timeout_ms
                    ))
                } else {
                    Attempt::Transient(format!(
                        "{stage} timed out after {}ms",
                        policy.timeout_ms
                    ))
                };
            }
        }
    }
}

async fn ensure_open(
    ctx: &SessionCtx,
    handle: &mut Option<Box<dyn FlashHandle>>,
) -> Result<(), String> {
    if handle.is_none() {
        match ctx.engine.open(&ctx.port).await {
            Ok(h) => *handle = Some(h),
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(())
}

async fn close(handle: Option<Box<dyn FlashHandle>>) {
    if let Some(h) = handle {
        h.close().await;
    }
}
