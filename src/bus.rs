//! Event bus between the core and the operator front end.
//!
//! Status events fan out to every subscriber over a bounded broadcast
//! channel: a subscriber that cannot keep up lags and loses the oldest
//! buffered events rather than ever blocking a publisher. Terminal session
//! outcomes are additionally retained in a per-device slot, and a lagging
//! subscriber recovers any it missed before resuming the stream, so a
//! Done/Failed/Cancelled verdict is never lost to backpressure.
//!
//! Commands from the front end (start, cancel) flow the other way over a
//! plain mpsc channel into the session manager.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};

use crate::event::{Event, EventKind};
use crate::transport::DeviceId;

/// Front-end command.
#[derive(Debug)]
pub enum Command {
    /// Claim the device and flash the image at `image` onto it.
    Start { device: DeviceId, image: PathBuf },
    /// Cancel the device's active session at the next safe checkpoint.
    Cancel { device: DeviceId },
}

struct Shared {
    tx: broadcast::Sender<Event>,
    /// Serializes sequence assignment and send so the stream order matches
    /// the sequence numbers.
    next_seq: Mutex<u64>,
    /// High-priority slot holding the latest terminal event per device.
    terminals: Mutex<HashMap<DeviceId, Event>>,
    /// Standing health flag; set while enumeration keeps failing.
    degraded: AtomicBool,
}

/// Handle to the bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
    command_tx: mpsc::Sender<Command>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer depth. The paired
    /// receiver goes to the session manager.
    pub fn new(event_buffer: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, _) = broadcast::channel(event_buffer.max(1));
        let (command_tx, command_rx) = mpsc::channel(32);
        let bus = Self {
            shared: Arc::new(Shared {
                tx,
                next_seq: Mutex::new(0),
                terminals: Mutex::new(HashMap::new()),
                degraded: AtomicBool::new(false),
            }),
            command_tx,
        };
        (bus, command_rx)
    }

    /// Publish an event. Never blocks; with no live subscribers the event is
    /// simply dropped (terminal slots are still updated).
    pub fn publish(&self, device: Option<DeviceId>, kind: EventKind) {
        let mut next_seq = self.shared.next_seq.lock();
        *next_seq += 1;
        let event = Event {
            seq: *next_seq,
            timestamp: OffsetDateTime::now_utc(),
            device,
            kind,
        };
        if event.is_terminal() {
            if let Some(id) = &event.device {
                self.shared
                    .terminals
                    .lock()
                    .insert(id.clone(), event.clone());
            }
        }
        let _ = self.shared.tx.send(event);
    }

    /// Subscribe to the full event stream from this point on.
    pub fn subscribe(&self) -> Subscription {
        let baseline = *self.shared.next_seq.lock();
        Subscription {
            rx: self.shared.tx.subscribe(),
            shared: self.shared.clone(),
            baseline,
            pending: VecDeque::new(),
            yielded_terminals: HashMap::new(),
        }
    }

    /// Submit a front-end command.
    pub async fn submit(&self, command: Command) -> Result<(), Command> {
        self.command_tx
            .send(command)
            .await
            .map_err(|e| e.0)
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.shared.degraded.store(degraded, Ordering::Relaxed);
    }

    /// Standing transport-health flag, true while enumeration keeps failing.
    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::Relaxed)
    }
}

/// One subscriber's view of the stream.
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    shared: Arc<Shared>,
    /// Bus sequence at subscribe time; nothing older is ever recovered.
    baseline: u64,
    /// Terminal events recovered after a lag, due out first.
    pending: VecDeque<Event>,
    /// Seq of the last terminal yielded per device, for lag deduplication.
    yielded_terminals: HashMap<DeviceId, u64>,
}

impl Subscription {
    /// Next event, or None once the bus is gone.
    ///
    /// After a lag this yields any missed terminal events (from the
    /// per-device slots) before resuming the live stream; a terminal that is
    /// later received normally as well is skipped, never duplicated.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            match self.rx.recv().await {
                Ok(event) => {
                    if event.is_terminal() {
                        let Some(device) = event.device.clone() else {
                            return Some(event);
                        };
                        let already = self
                            .yielded_terminals
                            .get(&device)
                            .is_some_and(|&seq| seq >= event.seq);
                        if already {
                            continue;
                        }
                        self.yielded_terminals.insert(device, event.seq);
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "event subscriber lagged, recovering terminals");
                    self.recover_terminals();
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn recover_terminals(&mut self) {
        let slots = self.shared.terminals.lock();
        let mut recovered: Vec<Event> = slots
            .values()
            .filter(|event| event.seq > self.baseline)
            .filter(|event| {
                let device = event.device.as_ref().expect("terminal slots carry a device");
                self.yielded_terminals
                    .get(device)
                    .is_none_or(|&seq| seq < event.seq)
            })
            .cloned()
            .collect();
        drop(slots);
        recovered.sort_by_key(|event| event.seq);
        for event in &recovered {
            let device = event.device.clone().expect("terminal slots carry a device");
            self.yielded_terminals.insert(device, event.seq);
        }
        self.pending.extend(recovered);
    }
}
