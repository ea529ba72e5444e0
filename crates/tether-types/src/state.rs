use serde::{Deserialize, Serialize};

/// Visible phase within an active turn. Orthogonal to compaction, which is
/// tracked separately because the engine can compact mid-turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPhase {
    Initializing,
    Thinking,
    Streaming,
    Finalizing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessingState {
    #[default]
    Idle,
    Queued {
        #[serde(alias = "messageId")]
        message_id: String,
    },
    Processing {
        phase: ProcessingPhase,
    },
    Interrupted,
}

impl ProcessingState {
    pub fn is_idle(&self) -> bool {
        matches!(self, ProcessingState::Idle)
    }

    pub fn is_processing(&self) -> bool {
        matches!(self, ProcessingState::Processing { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_state_tag() {
        let state = ProcessingState::Processing {
            phase: ProcessingPhase::Streaming,
        };
        let json = serde_json::to_value(&state).expect("serialize state");
        assert_eq!(json["state"], "processing");
        assert_eq!(json["phase"], "streaming");
    }

    #[test]
    fn queued_round_trips_message_id() {
        let state = ProcessingState::Queued {
            message_id: "msg_7".to_string(),
        };
        let json = serde_json::to_string(&state).expect("serialize state");
        let back: ProcessingState = serde_json::from_str(&json).expect("parse state");
        assert_eq!(back, state);
    }
}
