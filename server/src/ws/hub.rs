//! UI notification hub (§6): a broadcast channel carrying the three event
//! kinds this spec defines plus `CaptureDegraded`, reusing the donor's
//! `WsHub` broadcast-channel shape narrowed to UI delivery only — agent
//! connection tracking was a donor feature with no counterpart here.

use tokio::sync::broadcast;
use tracing::debug;

/// One notification pushed to subscribed UI clients.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub event: String,
    pub payload: serde_json::Value,
}

/// Named event kinds this pipeline emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NewDevice,
    NewThreat,
    FlowFinalized,
    CaptureDegraded,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::NewDevice => "new_device",
            EventKind::NewThreat => "new_threat",
            EventKind::FlowFinalized => "flow_finalized",
            EventKind::CaptureDegraded => "capture_degraded",
        }
    }
}

const CHANNEL_CAPACITY: usize = 1024;

/// UI-facing notification hub: a single broadcast channel, fire-and-forget.
pub struct WsHub {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl WsHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.tx.subscribe()
    }

    /// Broadcast an event. No-op (and logged at debug) if nothing is subscribed.
    pub fn broadcast(&self, event: EventKind, payload: serde_json::Value) {
        let msg = BroadcastMessage { event: event.as_str().to_string(), payload };
        if self.tx.send(msg).is_err() {
            debug!(event = event.as_str(), "no UI subscribers for broadcast");
        }
    }
}

impl Default for WsHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_broadcast_event() {
        let hub = WsHub::new();
        let mut rx = hub.subscribe();
        hub.broadcast(EventKind::NewThreat, serde_json::json!({"device_id": "ip:10.0.0.2"}));
        let msg = rx.recv().await.expect("broadcast must be delivered");
        assert_eq!(msg.event, "new_threat");
    }

    #[test]
    fn broadcast_without_subscribers_does_not_panic() {
        let hub = WsHub::new();
        hub.broadcast(EventKind::CaptureDegraded, serde_json::json!({}));
    }
}
