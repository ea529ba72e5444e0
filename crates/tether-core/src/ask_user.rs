use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tether_agent::{ToolDecision, ToolGate};
use tether_types::SessionEvent;

use crate::event_bus::EventBus;

pub const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(default)]
    pub questions: Value,
    pub status: String,
}

/// Routes the engine's AskUserQuestion tool calls to connected clients and
/// parks the invocation until someone answers. One handler per session; the
/// cancel token covers the session's lifetime, so a session teardown releases
/// every parked question.
#[derive(Clone)]
pub struct AskUserQuestionHandler {
    session_id: String,
    requests: Arc<RwLock<HashMap<String, QuestionRequest>>>,
    waiters: Arc<RwLock<HashMap<String, watch::Sender<Option<String>>>>>,
    event_bus: EventBus,
    cancel: CancellationToken,
}

impl AskUserQuestionHandler {
    pub fn new(session_id: &str, event_bus: EventBus, cancel: CancellationToken) -> Self {
        Self {
            session_id: session_id.to_string(),
            requests: Arc::new(RwLock::new(HashMap::new())),
            waiters: Arc::new(RwLock::new(HashMap::new())),
            event_bus,
            cancel,
        }
    }

    pub async fn ask(&self, questions: Value) -> QuestionRequest {
        let request = QuestionRequest {
            id: Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            questions: questions.clone(),
            status: "pending".to_string(),
        };
        let (tx, _rx) = watch::channel(None);
        self.requests
            .write()
            .await
            .insert(request.id.clone(), request.clone());
        self.waiters.write().await.insert(request.id.clone(), tx);
        self.event_bus.publish(SessionEvent::new(
            "question.asked",
            json!({
                "sessionID": self.session_id,
                "requestID": request.id,
                "questions": questions,
            }),
        ));
        request
    }

    pub async fn list_pending(&self) -> Vec<QuestionRequest> {
        self.requests
            .read()
            .await
            .values()
            .filter(|request| request.status == "pending")
            .cloned()
            .collect()
    }

    pub async fn reply(&self, id: &str, answer: &str) -> bool {
        {
            let mut requests = self.requests.write().await;
            let Some(request) = requests.get_mut(id) else {
                return false;
            };
            request.status = "answered".to_string();
        }
        self.event_bus.publish(SessionEvent::new(
            "question.replied",
            json!({
                "sessionID": self.session_id,
                "requestID": id,
                "answer": answer,
            }),
        ));
        if let Some(waiter) = self.waiters.read().await.get(id).cloned() {
            let _ = waiter.send(Some(answer.to_string()));
        }
        true
    }

    pub async fn wait_for_answer(&self, id: &str, cancel: CancellationToken) -> Option<String> {
        let mut rx = {
            let waiters = self.waiters.read().await;
            waiters.get(id).map(|tx| tx.subscribe())?
        };
        let immediate = { rx.borrow().clone() };
        if let Some(answer) = immediate {
            self.waiters.write().await.remove(id);
            return Some(answer);
        }
        let waited: Option<String> = tokio::select! {
            _ = cancel.cancelled() => None,
            changed = rx.changed() => {
                if changed.is_ok() {
                    let updated = { rx.borrow().clone() };
                    updated
                } else {
                    None
                }
            }
        };
        self.waiters.write().await.remove(id);
        waited
    }
}

#[async_trait]
impl ToolGate for AskUserQuestionHandler {
    async fn can_use_tool(&self, tool_name: &str, input: &Value) -> ToolDecision {
        if tool_name != ASK_USER_QUESTION_TOOL {
            return ToolDecision::Allow {
                updated_input: None,
            };
        }
        let questions = input.get("questions").cloned().unwrap_or_else(|| json!([]));
        let request = self.ask(questions).await;
        match self.wait_for_answer(&request.id, self.cancel.clone()).await {
            Some(answer) => {
                let mut updated = input.clone();
                if let Value::Object(ref mut map) = updated {
                    map.insert("answers".to_string(), Value::String(answer));
                }
                ToolDecision::Allow {
                    updated_input: Some(updated),
                }
            }
            None => ToolDecision::Deny {
                reason: "question cancelled before an answer arrived".to_string(),
            },
        }
    }
}
