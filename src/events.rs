//! Decoupled event bus for cross-component communication.
//!
//! The engine emits events via [`EventBus::emit`] and anything interested
//! (the history recorder, tests) subscribes via [`EventBus::subscribe`].
//! Built on [`tokio::sync::broadcast`] so emitting never waits on a
//! listener.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::consts::EVENT_BUS_CAPACITY;
use crate::present::DiagnosisPayload;

/// Events that flow through the system.
#[derive(Debug, Clone)]
pub enum Event {
    /// A request produced a result.
    DiagnosisCompleted {
        request_id: Uuid,
        image_digest: String,
        payload: DiagnosisPayload,
    },
}

/// A broadcast channel that any component can emit to or subscribe from.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all current subscribers.
    /// Returns the number of receivers that will see it.
    pub fn emit(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events. Returns a receiver that yields all
    /// future events (does not replay past ones).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}
