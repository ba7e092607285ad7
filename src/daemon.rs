//! Daemon lifecycle management.
//!
//! Wires the watcher, registry, session manager, and event bus together,
//! runs them on a task tracker, and handles signal-driven graceful shutdown.
//! A front end embedding the library takes its event/command handle from
//! [`Daemon::bus`] before calling [`Daemon::run`].

use std::sync::Arc;

use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::bus::{Command, EventBus};
use crate::config::Config;
use crate::engine::FlashEngine;
use crate::registry::Registry;
use crate::session::SessionManager;
use crate::transport::Transport;
use crate::watcher::Watcher;

pub struct Daemon {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    engine: Arc<dyn FlashEngine>,
    registry: Registry,
    bus: EventBus,
    command_rx: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(config: Config, transport: Arc<dyn Transport>, engine: Arc<dyn FlashEngine>) -> Self {
        let (bus, command_rx) = EventBus::new(config.event_buffer_depth());
        Self {
            config: Arc::new(config),
            transport,
            engine,
            registry: Registry::new(),
            bus,
            command_rx,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Daemon with the native sysfs transport and the esptool engine.
    #[cfg(target_os = "linux")]
    pub fn native(config: Config) -> Self {
        let engine = crate::engine::esptool::EsptoolEngine::new(config.esptool.clone());
        Self::new(
            config,
            Arc::new(crate::transport::linux::SysfsTransport::new()),
            Arc::new(engine),
        )
    }

    /// Event/command handle for a front end.
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Run the daemon until SIGINT/SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        let (detach_tx, detach_rx) = mpsc::channel(16);

        let watcher = Watcher::new(
            self.transport.clone(),
            self.registry.clone(),
            self.bus.clone(),
            detach_tx,
            self.config.signature,
            self.config.watcher.clone(),
            self.shutdown.clone(),
        );
        self.tracker.spawn(watcher.run());

        let manager = SessionManager::new(
            self.registry.clone(),
            self.bus.clone(),
            self.engine.clone(),
            self.config.clone(),
            self.command_rx,
            detach_rx,
            self.shutdown.clone(),
        );
        self.tracker.spawn(manager.run());

        // Mirror the feed into the log so the station is observable with no
        // front end attached.
        self.tracker.spawn({
            let mut events = self.bus.subscribe();
            let shutdown = self.shutdown.clone();
            async move {
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Some(event) => tracing::debug!(?event, "event"),
                            None => break,
                        },
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        });

        self.tracker.close();
        tracing::info!("started");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }

        self.shutdown.cancel();
        self.tracker.wait().await;
        tracing::info!("exiting");
        Ok(())
    }
}
