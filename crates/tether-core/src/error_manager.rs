use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::Level;

use tether_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tether_types::SessionEvent;

use crate::event_bus::EventBus;
use crate::truncate_text;

const RECENT_ERRORS_CAP: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct RecordedError {
    pub session_id: String,
    pub source: String,
    pub code: &'static str,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Classifies engine failure text into a stable code for clients and logs.
pub fn error_code(text: &str) -> &'static str {
    let lowered = text.to_lowercase();
    if lowered.contains("context length")
        || lowered.contains("context_length_exceeded")
        || lowered.contains("prompt is too long")
        || lowered.contains("maximum context")
    {
        "CONTEXT_LENGTH_EXCEEDED"
    } else if lowered.contains("rate limit") || lowered.contains("429") {
        "RATE_LIMIT_EXCEEDED"
    } else if lowered.contains("unauthorized")
        || lowered.contains("401")
        || lowered.contains("authentication")
        || lowered.contains("api key")
    {
        "AUTHENTICATION_ERROR"
    } else if lowered.contains("circuit breaker") {
        "CIRCUIT_BREAKER_TRIPPED"
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        "TIMEOUT"
    } else if lowered.contains("500")
        || lowered.contains("502")
        || lowered.contains("503")
        || lowered.contains("overloaded")
        || lowered.contains("server error")
    {
        "ENGINE_SERVER_ERROR"
    } else {
        "ENGINE_REQUEST_FAILED"
    }
}

/// True when the text carries the upstream invalid-request marker that feeds
/// the circuit breaker.
pub fn is_invalid_request_error(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("invalid_request_error")
        || lowered.contains("prompt is too long")
        || lowered.contains("request_too_large")
}

/// Records failures without ever failing itself: classify, remember a
/// bounded window of recent errors, log, and notify subscribers.
pub struct ErrorManager {
    bus: EventBus,
    recent: Mutex<VecDeque<RecordedError>>,
}

impl ErrorManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn handle_error(&self, session_id: &str, source: &str, error: &anyhow::Error) {
        let detail = format!("{error:#}");
        self.record(session_id, source, error_code(&detail), detail)
            .await;
    }

    pub async fn handle_error_text(&self, session_id: &str, source: &str, detail: &str) {
        self.record(session_id, source, error_code(detail), detail.to_string())
            .await;
    }

    /// For callers that already know the code, like the startup timer and
    /// the circuit breaker.
    pub async fn handle_error_coded(
        &self,
        session_id: &str,
        source: &str,
        code: &'static str,
        detail: &str,
    ) {
        self.record(session_id, source, code, detail.to_string())
            .await;
    }

    pub async fn recent_errors(&self) -> Vec<RecordedError> {
        self.recent.lock().await.iter().cloned().collect()
    }

    async fn record(&self, session_id: &str, source: &str, code: &'static str, detail: String) {
        let detail = truncate_text(&detail, 2_000);
        emit_event(
            Level::WARN,
            ProcessKind::Daemon,
            ObservabilityEvent {
                event: "session_error",
                component: source,
                session_id: Some(session_id),
                error_code: Some(code),
                detail: Some(&detail),
                ..Default::default()
            },
        );

        let recorded = RecordedError {
            session_id: session_id.to_string(),
            source: source.to_string(),
            code,
            detail: detail.clone(),
            at: Utc::now(),
        };
        let mut recent = self.recent.lock().await;
        recent.push_back(recorded);
        while recent.len() > RECENT_ERRORS_CAP {
            recent.pop_front();
        }
        drop(recent);

        self.bus.publish(SessionEvent::new(
            "session.error",
            json!({
                "sessionID": session_id,
                "code": code,
                "detail": truncate_text(&detail, 400),
            }),
        ));
    }
}
