//! Cluster event stream.
//!
//! Sessions publish the four lifecycle events on a broadcast channel that UI
//! relays and extensions subscribe to. Arrivals are additionally queued on an
//! unbounded channel owned by the barrier runner, so a slow observer can never
//! make the barrier miss one.

use mavc_types::{Cid, Message};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    /// Anything a drone sent, STAT or otherwise
    MessageIn { cid: Cid, message: Message },
    /// Something the monitor sent; `cid` is `None` for subnet broadcasts
    MessageOut { cid: Option<Cid>, message: Message },
    NewDroneAdd { cid: Cid },
    Arrive { cid: Cid, step: Option<u32> },
}

impl ClusterEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageIn { .. } => "message-in",
            Self::MessageOut { .. } => "message-out",
            Self::NewDroneAdd { .. } => "new-drone-add",
            Self::Arrive { .. } => "arrive",
        }
    }

    /// JSON payload relayed to UI clients.
    pub fn payload(&self) -> Value {
        match self {
            Self::MessageIn { cid, message } => json!({ "CID": cid, "msg": message }),
            Self::MessageOut { cid, message } => json!({ "CID": cid, "msg": message }),
            Self::NewDroneAdd { cid } => json!({ "CID": cid }),
            Self::Arrive { cid, step } => json!({ "CID": cid, "Step": step }),
        }
    }
}

/// An ARRIVED report headed for the barrier runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrival {
    pub cid: Cid,
    pub step: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    events: broadcast::Sender<ClusterEvent>,
    arrivals: mpsc::UnboundedSender<Arrival>,
}

impl EventBus {
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<Arrival>) {
        let (events, _) = broadcast::channel(capacity);
        let (arrivals, rx) = mpsc::unbounded_channel();
        (Self { events, arrivals }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: ClusterEvent) {
        trace!("event {}", event.name());
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn arrive(&self, cid: Cid, step: Option<u32>) {
        let _ = self.arrivals.send(Arrival { cid, step });
        self.emit(ClusterEvent::Arrive { cid, step });
    }
}
