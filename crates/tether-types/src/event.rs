use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broadcast notification for in-process subscribers (UI bridges, loggers).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEvent {
    pub event_type: String,
    pub properties: Value,
}

impl SessionEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }
}

/// Delivery scope for hub publishes. Session scope fans out to clients
/// attached to that session only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Session(String),
    Broadcast,
}

/// Message pushed through the hub toward connected clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Value,
    pub scope: Scope,
}

impl OutboundMessage {
    pub fn session(session_id: impl Into<String>, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            scope: Scope::Session(session_id.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_constructor_sets_scope() {
        let msg = OutboundMessage::session("ses_1", "message.delta", json!({"id": "m1"}));
        assert_eq!(msg.topic, "message.delta");
        assert!(matches!(msg.scope, Scope::Session(ref id) if id == "ses_1"));
    }
}
