//! Rollout events.
//!
//! Consumers that cache derived configuration subscribe here and reload
//! when an instance is committed.

use tokio::sync::broadcast;
use tracing::trace;

use convoy_core::InstanceRef;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutEvent {
    /// A rollout of this instance finished successfully.
    Committed(InstanceRef),
}

/// Fan-out of rollout events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RolloutEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RolloutEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscriber is not an error.
    pub fn emit(&self, event: RolloutEvent) {
        let receivers = self.tx.send(event).unwrap_or(0);
        trace!(receivers, "rollout event emitted");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_committed() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(RolloutEvent::Committed(InstanceRef::new("database", "default")));

        let event = rx.recv().await.unwrap();
        assert_eq!(event, RolloutEvent::Committed(InstanceRef::new("database", "default")));
    }

    #[test]
    fn emit_without_subscribers() {
        EventBus::new().emit(RolloutEvent::Committed(InstanceRef::new("a", "b")));
    }
}
