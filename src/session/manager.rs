//! Session manager.
//!
//! Select loop over front-end commands, watcher detach notices, and runner
//! completions. Start claims the device through the registry (the only
//! arbiter of claim ownership) and spawns one runner task per session;
//! sessions for different devices run in parallel.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bus::{Command, EventBus};
use crate::config::Config;
use crate::engine::FlashEngine;
use crate::error::Error;
use crate::event::EventKind;
use crate::image::FirmwareImage;
use crate::registry::Registry;
use crate::session::{runner, AbortCause, SessionControl};
use crate::transport::DeviceId;

pub struct SessionManager {
    registry: Registry,
    bus: EventBus,
    engine: Arc<dyn FlashEngine>,
    config: Arc<Config>,
    command_rx: mpsc::Receiver<Command>,
    detach_rx: mpsc::Receiver<DeviceId>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    active: HashMap<DeviceId, Arc<SessionControl>>,
    done_tx: mpsc::Sender<(DeviceId, Arc<SessionControl>)>,
    done_rx: mpsc::Receiver<(DeviceId, Arc<SessionControl>)>,
}

impl SessionManager {
    pub fn new(
        registry: Registry,
        bus: EventBus,
        engine: Arc<dyn FlashEngine>,
        config: Arc<Config>,
        command_rx: mpsc::Receiver<Command>,
        detach_rx: mpsc::Receiver<DeviceId>,
        shutdown: CancellationToken,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::channel(32);
        Self {
            registry,
            bus,
            engine,
            config,
            command_rx,
            detach_rx,
            shutdown,
            tracker: TaskTracker::new(),
            active: HashMap::new(),
            done_tx,
            done_rx,
        }
    }

    /// Run until shutdown, then wait for in-flight sessions to reach their
    /// terminal events.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(command) = self.command_rx.recv() => self.handle_command(command),
                Some(id) = self.detach_rx.recv() => self.handle_detach(id),
                Some((id, control)) = self.done_rx.recv() => {
                    // A fresh session may already occupy the slot; only the
                    // finished session's own control is evicted.
                    if self.active.get(&id).is_some_and(|c| Arc::ptr_eq(c, &control)) {
                        self.active.remove(&id);
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        // Session tokens are children of the shutdown token, so runners are
        // already stopping at their next safe checkpoint.
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!("session manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { device, image } => self.handle_start(device, &image),
            Command::Cancel { device } => self.handle_cancel(device),
        }
    }

    fn handle_start(&mut self, id: DeviceId, image_path: &Path) {
        let image = match FirmwareImage::load(image_path) {
            Ok(image) => image,
            Err(e) => {
                self.reject(id, Error::Fatal(format!("firmware image: {e}")));
                return;
            }
        };

        let entry = match self.registry.try_claim(&id) {
            Ok(entry) => entry,
            Err(error) => {
                self.reject(id, error);
                return;
            }
        };

        let Some(port) = entry.info.primary_port().map(String::from) else {
            self.registry.release(&id);
            self.reject(id, Error::Fatal("adapter exposes no serial port node".into()));
            return;
        };

        let control = Arc::new(SessionControl::new(&self.shutdown));
        self.active.insert(id.clone(), control.clone());

        self.bus.publish(
            Some(id.clone()),
            EventKind::SessionStarted {
                image_bytes: image.total_bytes(),
            },
        );

        let ctx = runner::SessionCtx {
            id: id.clone(),
            port,
            image,
            engine: self.engine.clone(),
            config: self.config.clone(),
            bus: self.bus.clone(),
            registry: self.registry.clone(),
            control: control.clone(),
        };
        let done_tx = self.done_tx.clone();
        let done_control = control;
        self.tracker.spawn(async move {
            runner::run(ctx).await;
            let _ = done_tx.send((id, done_control)).await;
        });
    }

    fn handle_cancel(&mut self, id: DeviceId) {
        if let Some(control) = self.active.get(&id) {
            tracing::info!(device = %id, "cancel requested");
            control.abort(AbortCause::UserCancel);
        } else if self.registry.get(&id).is_some() {
            // Idle device; cancel is a no-op, not an error.
            tracing::debug!(device = %id, "cancel with no active session ignored");
        } else {
            let error = Error::NoSuchDevice(id.clone());
            self.reject(id, error);
        }
    }

    fn handle_detach(&mut self, id: DeviceId) {
        if let Some(control) = self.active.get(&id) {
            tracing::warn!(device = %id, "detach with active session, forcing failure");
            control.abort(AbortCause::Disconnected);
        }
    }

    fn reject(&self, id: DeviceId, error: Error) {
        tracing::warn!(device = %id, %error, "command rejected");
        self.bus
            .publish(Some(id), EventKind::CommandRejected { error });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Subscription;
    use crate::config::StagePolicy;
    use crate::engine::mock::{MockEngine, StageScript};
    use crate::engine::Stage;
    use crate::transport::mock::ft232h;
    use std::io::Write as _;
    use std::time::Duration;

    struct Fixture {
        bus: EventBus,
        registry: Registry,
        engine: MockEngine,
        detach_tx: mpsc::Sender<DeviceId>,
        shutdown: CancellationToken,
        // Keeps the image file alive for the test's duration.
        _image_dir: tempfile::TempDir,
        image: std::path::PathBuf,
    }

    fn start(config: Config) -> Fixture {
        let registry = Registry::new();
        let engine = MockEngine::new();
        let (bus, command_rx) = EventBus::new(256);
        let (detach_tx, detach_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        let manager = SessionManager::new(
            registry.clone(),
            bus.clone(),
            Arc::new(engine.clone()),
            Arc::new(config),
            command_rx,
            detach_rx,
            shutdown.clone(),
        );
        tokio::spawn(manager.run());

        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("app.bin");
        let mut f = std::fs::File::create(&image).unwrap();
        f.write_all(&[0u8; 4096]).unwrap();

        Fixture {
            bus,
            registry,
            engine,
            detach_tx,
            shutdown,
            _image_dir: dir,
            image,
        }
    }

    impl Fixture {
        fn attach(&self) -> DeviceId {
            self.registry.register(ft232h("S1")).id.clone()
        }

        async fn start_session(&self, id: &DeviceId) {
            self.bus
                .submit(Command::Start {
                    device: id.clone(),
                    image: self.image.clone(),
                })
                .await
                .unwrap();
        }
    }

    async fn next_kind(sub: &mut Subscription) -> EventKind {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(600), sub.recv())
                .await
                .expect("no event within bounded time")
                .expect("bus closed");
            // Progress chatter is asserted only where it matters.
            if matches!(event.kind, EventKind::StageProgress { .. }) {
                continue;
            }
            return event.kind;
        }
    }

    async fn wait_for_stage(sub: &mut Subscription, stage: Stage) -> u32 {
        loop {
            if let EventKind::StageStarted { stage: s, attempt } = next_kind(sub).await {
                if s == stage {
                    return attempt;
                }
            }
        }
    }

    async fn terminal(sub: &mut Subscription) -> EventKind {
        loop {
            let kind = next_kind(sub).await;
            match kind {
                EventKind::SessionDone { .. }
                | EventKind::SessionFailed { .. }
                | EventKind::SessionCancelled => return kind,
                _ => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_on_unknown_identity_is_rejected() {
        let fx = start(Config::default());
        let mut sub = fx.bus.subscribe();

        fx.bus
            .submit(Command::Start {
                device: "0403:6014/GHOST".into(),
                image: fx.image.clone(),
            })
            .await
            .unwrap();

        match next_kind(&mut sub).await {
            EventKind::CommandRejected { error } => {
                assert!(matches!(error, Error::NoSuchDevice(_)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // No session was created for the unknown identity.
        assert!(fx.engine.calls().is_empty());
        fx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_walks_stages_in_order() {
        let fx = start(Config::default());
        let mut sub = fx.bus.subscribe();
        let id = fx.attach();
        fx.start_session(&id).await;

        assert!(matches!(
            next_kind(&mut sub).await,
            EventKind::SessionStarted { image_bytes: 4096 }
        ));
        for stage in Stage::SEQUENCE {
            match next_kind(&mut sub).await {
                EventKind::StageStarted { stage: s, attempt } => {
                    assert_eq!(s, stage);
                    assert_eq!(attempt, 1);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(matches!(
            next_kind(&mut sub).await,
            EventKind::SessionDone { .. }
        ));
        assert_eq!(fx.engine.calls(), Stage::SEQUENCE.to_vec());
        assert_eq!(fx.engine.closes(), 1);
        fx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_start_on_same_device_yields_busy() {
        let mut config = Config::default();
        // Hold the session in Connect so the second start races a live claim.
        config.stages.connect = StagePolicy::new(1, 3_600_000);
        let fx = start(config);
        let mut sub = fx.bus.subscribe();
        let id = fx.attach();
        fx.engine.script(Stage::Connect, StageScript::cooperative_park());

        fx.start_session(&id).await;
        wait_for_stage(&mut sub, Stage::Connect).await;

        fx.start_session(&id).await;
        match next_kind(&mut sub).await {
            EventKind::CommandRejected { error } => {
                assert!(matches!(error, Error::DeviceBusy(_)));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        fx.bus
            .submit(Command::Cancel { device: id.clone() })
            .await
            .unwrap();
        assert!(matches!(terminal(&mut sub).await, EventKind::SessionCancelled));

        // The claim is free again after the terminal event.
        fx.start_session(&id).await;
        assert!(matches!(
            next_kind(&mut sub).await,
            EventKind::SessionStarted { .. }
        ));
        fx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_and_reset_attempt_counter() {
        let fx = start(Config::default());
        let mut sub = fx.bus.subscribe();
        let id = fx.attach();
        // Fails twice, succeeds on the third attempt (budget is 3).
        fx.engine
            .script(Stage::UploadStub, StageScript::transient("sync failed"));
        fx.engine
            .script(Stage::UploadStub, StageScript::transient("sync failed"));
        fx.start_session(&id).await;

        assert_eq!(wait_for_stage(&mut sub, Stage::UploadStub).await, 1);
        assert_eq!(wait_for_stage(&mut sub, Stage::UploadStub).await, 2);
        assert_eq!(wait_for_stage(&mut sub, Stage::UploadStub).await, 3);
        // Next stage starts back at attempt 1.
        assert_eq!(wait_for_stage(&mut sub, Stage::Erase).await, 1);
        assert!(matches!(
            terminal(&mut sub).await,
            EventKind::SessionDone { .. }
        ));
        fx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_fails_session_before_next_stage() {
        let fx = start(Config::default());
        let mut sub = fx.bus.subscribe();
        let id = fx.attach();
        // Erase budget is 2; burn both.
        fx.engine
            .script(Stage::Erase, StageScript::transient("flash busy"));
        fx.engine
            .script(Stage::Erase, StageScript::transient("flash busy"));
        fx.start_session(&id).await;

        match terminal(&mut sub).await {
            EventKind::SessionFailed { error } => match error {
                Error::StageExhausted { stage, attempts, .. } => {
                    assert_eq!(stage, Stage::Erase);
                    assert_eq!(attempts, 2);
                }
                other => panic!("unexpected error: {other:?}"),
            },
            other => panic!("unexpected event: {other:?}"),
        }
        // Write was never entered.
        assert!(!fx.engine.calls().contains(&Stage::Write));
        // Device can be claimed fresh by the operator.
        assert!(fx.registry.try_claim(&id).is_ok());
        fx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_bypasses_retry() {
        let fx = start(Config::default());
        let mut sub = fx.bus.subscribe();
        let id = fx.attach();
        fx.engine
            .script(Stage::Connect, StageScript::fatal("unsupported chip id"));
        fx.start_session(&id).await;

        match terminal(&mut sub).await {
            EventKind::SessionFailed { error } => assert!(matches!(error, Error::Fatal(_))),
            other => panic!("unexpected event: {other:?}"),
        }
        // Exactly one attempt, despite a budget of 3.
        assert_eq!(fx.engine.calls(), vec![Stage::Connect]);
        fx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn write_timeout_past_point_of_no_return_is_fatal() {
        let fx = start(Config::default());
        let mut sub = fx.bus.subscribe();
        let id = fx.attach();
        // Write reports progress, then hangs well past its 30s timeout.
        fx.engine.script(
            Stage::Write,
            StageScript::hang(Duration::from_secs(3_600)).with_progress(1024, 4096),
        );
        fx.start_session(&id).await;

        match terminal(&mut sub).await {
            EventKind::SessionFailed { error } => match error {
                Error::Fatal(msg) => assert!(msg.contains("point of no return"), "{msg}"),
                other => panic!("unexpected error: {other:?}"),
            },
            other => panic!("unexpected event: {other:?}"),
        }
        fx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn write_timeout_without_progress_exhausts_the_single_attempt() {
        let fx = start(Config::default());
        let mut sub = fx.bus.subscribe();
        let id = fx.attach();
        fx.engine
            .script(Stage::Write, StageScript::hang(Duration::from_secs(3_600)));
        fx.start_session(&id).await;

        match terminal(&mut sub).await {
            EventKind::SessionFailed { error } => {
                assert!(matches!(
                    error,
                    Error::StageExhausted {
                        stage: Stage::Write,
                        attempts: 1,
                        ..
                    }
                ));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        fx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_erase_stops_before_write() {
        let fx = start(Config::default());
        let mut sub = fx.bus.subscribe();
        let id = fx.attach();
        fx.engine.script(Stage::Erase, StageScript::cooperative_park());
        fx.start_session(&id).await;

        wait_for_stage(&mut sub, Stage::Erase).await;
        fx.bus
            .submit(Command::Cancel { device: id.clone() })
            .await
            .unwrap();

        assert!(matches!(terminal(&mut sub).await, EventKind::SessionCancelled));
        assert!(!fx.engine.calls().contains(&Stage::Write));
        assert_eq!(fx.engine.closes(), 1);
        assert!(fx.registry.try_claim(&id).is_ok());
        fx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn detach_during_flash_fails_with_disconnected() {
        let fx = start(Config::default());
        let mut sub = fx.bus.subscribe();
        let id = fx.attach();
        fx.engine.script(Stage::Write, StageScript::cooperative_park());
        fx.start_session(&id).await;

        wait_for_stage(&mut sub, Stage::Write).await;
        // What the watcher does on detach: drop the entry, notify the manager.
        fx.registry.unregister(&id);
        fx.detach_tx.send(id.clone()).await.unwrap();

        match terminal(&mut sub).await {
            EventKind::SessionFailed { error } => {
                assert!(matches!(error, Error::Disconnected));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Re-attach and start again: the identity is usable immediately.
        fx.registry.register(ft232h("S1"));
        fx.start_session(&id).await;
        assert!(matches!(
            next_kind(&mut sub).await,
            EventKind::SessionStarted { .. }
        ));
        fx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn port_open_failure_shares_connect_budget() {
        let fx = start(Config::default());
        let mut sub = fx.bus.subscribe();
        let id = fx.attach();
        fx.engine.fail_opens(1);
        fx.start_session(&id).await;

        // First connect attempt dies on open, second reopens and proceeds.
        assert_eq!(wait_for_stage(&mut sub, Stage::Connect).await, 1);
        match next_kind(&mut sub).await {
            EventKind::StageFailed {
                stage: Stage::Connect,
                will_retry: true,
                ..
            } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(wait_for_stage(&mut sub, Stage::Connect).await, 2);
        assert!(matches!(
            terminal(&mut sub).await,
            EventKind::SessionDone { .. }
        ));
        assert_eq!(fx.engine.opens(), 1);
        fx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn bad_image_path_is_rejected_without_claiming() {
        let fx = start(Config::default());
        let mut sub = fx.bus.subscribe();
        let id = fx.attach();

        fx.bus
            .submit(Command::Start {
                device: id.clone(),
                image: fx.image.with_file_name("missing.bin"),
            })
            .await
            .unwrap();

        assert!(matches!(
            next_kind(&mut sub).await,
            EventKind::CommandRejected { .. }
        ));
        // The claim was never taken.
        assert!(fx.registry.try_claim(&id).is_ok());
        fx.shutdown.cancel();
    }
}
