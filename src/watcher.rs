//! Device watcher.
//!
//! One long-lived task that keeps the registry in sync with the transport
//! layer. Every tick enumerates the bus and diffs against the previous scan,
//! so attach/detach notifications and reconciliation after an error are the
//! same mechanism; nothing present at (re)start can be missed. Devices not
//! matching the configured programmer signature are ignored.
//!
//! Enumeration failures back off exponentially and, past a consecutive
//! threshold, raise a standing TransportDegraded flag toward the front end.
//! The watcher never terminates the process.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::config::{UsbSignature, WatcherConfig};
use crate::event::EventKind;
use crate::registry::Registry;
use crate::transport::{DeviceId, Transport, UsbDeviceInfo};

pub struct Watcher {
    transport: Arc<dyn Transport>,
    registry: Registry,
    bus: EventBus,
    /// Detach notices for the session manager, to force-fail live sessions.
    detach_tx: mpsc::Sender<DeviceId>,
    signature: UsbSignature,
    config: WatcherConfig,
    shutdown: CancellationToken,
}

impl Watcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Registry,
        bus: EventBus,
        detach_tx: mpsc::Sender<DeviceId>,
        signature: UsbSignature,
        config: WatcherConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            registry,
            bus,
            detach_tx,
            signature,
            config,
            shutdown,
        }
    }

    pub async fn run(self) {
        let mut known: HashMap<DeviceId, UsbDeviceInfo> = HashMap::new();
        let mut failures: u32 = 0;
        let mut backoff = self.config.backoff_base();

        loop {
            match self.transport.enumerate().await {
                Ok(devices) => {
                    if failures >= self.config.degraded_after {
                        tracing::info!("transport enumeration recovered");
                        self.bus.set_degraded(false);
                        self.bus.publish(None, EventKind::TransportRecovered);
                    }
                    failures = 0;
                    backoff = self.config.backoff_base();

                    let present: HashMap<DeviceId, UsbDeviceInfo> = devices
                        .into_iter()
                        .filter(|d| self.signature.matches(d.vid, d.pid))
                        .map(|d| (d.id(), d))
                        .collect();
                    self.reconcile(&mut known, present).await;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(%e, failures, "device enumeration failed");
                    if failures == self.config.degraded_after {
                        self.bus.set_degraded(true);
                        self.bus.publish(
                            None,
                            EventKind::TransportDegraded {
                                error: e.to_string(),
                            },
                        );
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.cancelled() => return,
                    }
                    backoff = (backoff * 2).min(self.config.backoff_cap());
                    continue;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = self.shutdown.cancelled() => return,
            }
        }
    }

    async fn reconcile(
        &self,
        known: &mut HashMap<DeviceId, UsbDeviceInfo>,
        present: HashMap<DeviceId, UsbDeviceInfo>,
    ) {
        for (id, info) in &present {
            if !known.contains_key(id) {
                tracing::info!(device = %id, port = ?info.primary_port(), "adapter attached");
                self.registry.register(info.clone());
                self.bus.publish(
                    Some(id.clone()),
                    EventKind::Attached { info: info.clone() },
                );
            }
        }

        let gone: Vec<DeviceId> = known
            .keys()
            .filter(|id| !present.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            tracing::info!(device = %id, "adapter detached");
            self.registry.unregister(&id);
            self.bus.publish(Some(id.clone()), EventKind::Detached);
            // The manager decides whether a session needs force-failing.
            let _ = self.detach_tx.send(id).await;
        }

        *known = present;
    }
}
