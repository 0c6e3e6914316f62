//! Typed notifications published by the gateway.
//!
//! Realtime sessions subscribe to learn when the gateway has moved to a
//! different node.

use tokio::sync::broadcast;
use tracing::debug;

use hive_shared::protocol::ReassignReason;
use hive_shared::types::NodeId;

const EVENT_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// The registry handed the client a different node.
    Reassigned {
        previous: Option<NodeId>,
        node_id: NodeId,
        endpoint: String,
        reason: ReassignReason,
    },
    /// A node call failed in a way that warrants attention.
    NodeFailed { node_id: NodeId, error: String },
}

pub struct GatewayEvents {
    sender: broadcast::Sender<GatewayEvent>,
}

impl GatewayEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn emit(&self, event: GatewayEvent) {
        match self.sender.send(event) {
            Ok(count) => debug!(receivers = count, "gateway event sent"),
            Err(_) => debug!("gateway event dropped (no receivers)"),
        }
    }
}

impl Default for GatewayEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let events = GatewayEvents::new();
        let mut rx = events.subscribe();
        let event = GatewayEvent::NodeFailed {
            node_id: NodeId::from("n1"),
            error: "boom".into(),
        };
        events.emit(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let events = GatewayEvents::new();
        events.emit(GatewayEvent::NodeFailed {
            node_id: NodeId::from("n1"),
            error: "nobody listening".into(),
        });
        assert_eq!(events.receiver_count(), 0);
    }
}
