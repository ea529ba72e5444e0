use tokio::sync::Mutex;

use tether_types::{EngineMessage, ProcessingPhase, ProcessingState, SystemSubtype};

struct StateInner {
    state: ProcessingState,
    compacting: bool,
}

/// Per-session phase tracker. Setters are plain; sequencing is the
/// orchestrator's job. Compaction is a separate flag because the engine can
/// compact in any phase, so no phase transition touches it.
pub struct ProcessingStateManager {
    inner: Mutex<StateInner>,
}

impl ProcessingStateManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                state: ProcessingState::Idle,
                compacting: false,
            }),
        }
    }

    pub async fn state(&self) -> ProcessingState {
        self.inner.lock().await.state.clone()
    }

    pub async fn is_compacting(&self) -> bool {
        self.inner.lock().await.compacting
    }

    pub async fn set_idle(&self) {
        self.inner.lock().await.state = ProcessingState::Idle;
    }

    pub async fn set_queued(&self, message_id: &str) {
        self.inner.lock().await.state = ProcessingState::Queued {
            message_id: message_id.to_string(),
        };
    }

    pub async fn set_processing(&self, phase: ProcessingPhase) {
        self.inner.lock().await.state = ProcessingState::Processing { phase };
    }

    pub async fn set_interrupted(&self) {
        self.inner.lock().await.state = ProcessingState::Interrupted;
    }

    pub async fn set_compacting(&self, compacting: bool) {
        self.inner.lock().await.compacting = compacting;
    }
}

impl Default for ProcessingStateManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps an engine output message to the phase it implies, if any. System
/// status/compaction markers and user messages carry no phase signal.
pub fn detect_phase_from_message(message: &EngineMessage) -> Option<ProcessingPhase> {
    match message {
        EngineMessage::System(system) => match system.subtype {
            SystemSubtype::Init => Some(ProcessingPhase::Initializing),
            _ => None,
        },
        EngineMessage::Assistant(assistant) => {
            if assistant.is_thinking_only() {
                Some(ProcessingPhase::Thinking)
            } else {
                Some(ProcessingPhase::Streaming)
            }
        }
        EngineMessage::User(_) => None,
        EngineMessage::Result(_) => Some(ProcessingPhase::Finalizing),
    }
}
