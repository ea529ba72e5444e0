use tokio::sync::broadcast;

use tether_types::{OutboundMessage, Scope};

/// Fan-out toward connected clients. Transports attach by subscribing and
/// forwarding whatever matches the sessions they serve.
#[derive(Clone)]
pub struct MessageHub {
    tx: broadcast::Sender<OutboundMessage>,
}

impl MessageHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.tx.subscribe()
    }

    pub fn publish(&self, message: OutboundMessage) {
        let _ = self.tx.send(message);
    }

    /// Publishes a payload scoped to one session's clients.
    pub fn publish_to_session(
        &self,
        session_id: &str,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) {
        self.publish(OutboundMessage::session(session_id, topic, payload));
    }
}

impl Default for MessageHub {
    fn default() -> Self {
        Self::new()
    }
}

pub fn scope_matches(scope: &Scope, session_id: &str) -> bool {
    match scope {
        Scope::Session(id) => id == session_id,
        Scope::Broadcast => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn session_publish_carries_scope() {
        let hub = MessageHub::new();
        let mut rx = hub.subscribe();

        hub.publish_to_session("ses_1", "message.delta", json!({"id": "m1"}));

        let got = rx.recv().await.expect("receive published message");
        assert_eq!(got.topic, "message.delta");
        assert!(scope_matches(&got.scope, "ses_1"));
        assert!(!scope_matches(&got.scope, "ses_2"));
    }

    #[test]
    fn broadcast_scope_matches_everyone() {
        assert!(scope_matches(&Scope::Broadcast, "anything"));
    }
}
