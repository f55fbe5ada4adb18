//! Event types and the event bus seam (spec §6.4).
//!
//! Payloads never carry secret values — only keys, names, and statuses. The
//! engine degrades gracefully with no subscriber at all: emitting an event is
//! always non-blocking and never fatal to the run.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// One of the event kinds the engine emits over the course of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    PlaybookStart { total_tasks: usize },
    PlaybookEnd { status: String },
    TaskStart { task: String },
    TaskEnd { task: String, status: String },
    TaskStatusChanged { task: String, status: String },
    ModuleExecutionStart { task: String, module_type: String },
    ModuleExecutionEnd { task: String, module_type: String, ok: bool },
    SecretAccessed { secret_key: String },
    FatalErrorOccurred { message: String },
    RecordErrorOccurred { task: String, message: String },
}

/// Sink trait a host process implements to observe engine events. The
/// default [`NullEventSink`] drops everything.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// No-op sink used when no host subscriber is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: Event) {}
}

/// `tokio::sync::broadcast`-backed bus: cheap to clone, non-blocking to
/// publish to (a lagging or absent subscriber never stalls the emitter).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: Event) {
        // A send error just means there are currently no subscribers; that
        // is not a failure condition for the engine.
        let _ = self.sender.send(Arc::new(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_delivers_to_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit(Event::SecretAccessed {
            secret_key: "K".to_string(),
        });
        let ev = rx.recv().await.unwrap();
        matches!(&*ev, Event::SecretAccessed { secret_key } if secret_key == "K");
    }

    #[test]
    fn emit_without_subscriber_does_not_panic() {
        let bus = EventBus::new(4);
        bus.emit(Event::PlaybookStart { total_tasks: 1 });
    }
}
