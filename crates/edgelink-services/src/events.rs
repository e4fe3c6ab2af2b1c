//! Membership event delivery.
//!
//! The core emits into one `EventSink`. Fan-out to several subscribers
//! happens at the channel, not inside the core.

use tokio::sync::{broadcast, mpsc};

use edgelink_core::MembershipEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: MembershipEvent);
}

/// Broadcast-channel event bus. Slow subscribers lag and lose events rather
/// than stall the emitter.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MembershipEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: MembershipEvent) {
        tracing::debug!(%event, "membership event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl EventSink for mpsc::UnboundedSender<MembershipEvent> {
    fn emit(&self, event: MembershipEvent) {
        let _ = self.send(event);
    }
}
