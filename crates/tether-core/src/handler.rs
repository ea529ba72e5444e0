use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use tether_types::{
    AssistantMessage, ContentBlock, EngineMessage, ResultMessage, Session, SessionEvent,
    SystemMessage, SystemSubtype, UserMessage,
};

use crate::context_tracker::{parse_context_report, ContextTracker};
use crate::error_manager::{is_invalid_request_error, ErrorManager};
use crate::event_bus::EventBus;
use crate::message_hub::MessageHub;
use crate::message_queue::MessageQueue;
use crate::processing_state::{detect_phase_from_message, ProcessingStateManager};
use crate::query_runner::QueryLifecycle;
use crate::storage::{MessageStatus, Storage, StoredMessage};

const BREAKER_NOTICE: &str = "The last several turns hit an upstream invalid-request error, so \
further engine calls are paused for this session. Shorten the conversation or start a new \
session, then try again.";

#[derive(Default)]
struct BreakerState {
    consecutive: u32,
    tripped: bool,
    cooldown: Option<JoinHandle<()>>,
}

pub struct MessageHandlerDeps {
    pub session_id: String,
    pub storage: Arc<Storage>,
    pub bus: EventBus,
    pub hub: MessageHub,
    pub queue: Arc<MessageQueue>,
    pub state: Arc<ProcessingStateManager>,
    pub tracker: Arc<ContextTracker>,
    pub errors: Arc<ErrorManager>,
    pub lifecycle: Arc<dyn QueryLifecycle>,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
}

/// Processes each engine output message: phase detection, persistence,
/// broadcast, metadata accounting, context probing, and the invalid-request
/// circuit breaker. Dispatch is non-exclusive; several rules can apply to
/// one message.
pub struct MessageHandler {
    session_id: String,
    storage: Arc<Storage>,
    bus: EventBus,
    hub: MessageHub,
    queue: Arc<MessageQueue>,
    state: Arc<ProcessingStateManager>,
    tracker: Arc<ContextTracker>,
    errors: Arc<ErrorManager>,
    lifecycle: Arc<dyn QueryLifecycle>,
    breaker: Arc<Mutex<BreakerState>>,
    breaker_threshold: u32,
    breaker_cooldown_ms: u64,
}

impl MessageHandler {
    pub fn new(deps: MessageHandlerDeps) -> Self {
        Self {
            session_id: deps.session_id,
            storage: deps.storage,
            bus: deps.bus,
            hub: deps.hub,
            queue: deps.queue,
            state: deps.state,
            tracker: deps.tracker,
            errors: deps.errors,
            lifecycle: deps.lifecycle,
            breaker: Arc::new(Mutex::new(BreakerState::default())),
            breaker_threshold: deps.breaker_threshold,
            breaker_cooldown_ms: deps.breaker_cooldown_ms,
        }
    }

    pub async fn handle_message(&self, mut message: EngineMessage) -> anyhow::Result<()> {
        if let Some(phase) = detect_phase_from_message(&message) {
            self.state.set_processing(phase).await;
        }

        if let EngineMessage::User(ref mut user) = message {
            user.synthetic = true;
            if user.replay {
                if let Some(breakdown) = parse_context_report(&user.message.content.plain_text()) {
                    // Context probe replay: internal bookkeeping only, the
                    // transcript never sees it.
                    self.tracker.update_with_detailed_breakdown(breakdown).await;
                    self.bus.publish(SessionEvent::new(
                        "context.updated",
                        json!({
                            "sessionID": self.session_id,
                            "context": self.tracker.current().await,
                        }),
                    ));
                    return Ok(());
                }
            }
        }

        let inserted = self
            .storage
            .append_message(StoredMessage::new(
                &self.session_id,
                message.clone(),
                MessageStatus::Sent,
            ))
            .await?;
        if inserted {
            self.hub.publish_to_session(
                &self.session_id,
                "message.delta",
                serde_json::to_value(&message)?,
            );
        }

        match &message {
            EngineMessage::System(system) => self.handle_system(system).await?,
            EngineMessage::Assistant(assistant) => self.handle_assistant(assistant).await?,
            EngineMessage::User(user) => self.handle_user(user).await?,
            EngineMessage::Result(result) => self.handle_result(result).await?,
        }
        Ok(())
    }

    async fn handle_system(&self, system: &SystemMessage) -> anyhow::Result<()> {
        match system.subtype {
            SystemSubtype::Init => {
                if let Some(sdk_session_id) = &system.session_id {
                    if let Some(updated) = self
                        .storage
                        .record_sdk_session(&self.session_id, sdk_session_id)
                        .await?
                    {
                        self.publish_session_updated(&updated, "sdk-session");
                    }
                }
            }
            SystemSubtype::Status => {
                if system.status.as_deref() == Some("compacting") {
                    self.state.set_compacting(true).await;
                }
            }
            SystemSubtype::CompactBoundary => {
                self.state.set_compacting(false).await;
            }
            SystemSubtype::Other => {}
        }
        Ok(())
    }

    async fn handle_assistant(&self, assistant: &AssistantMessage) -> anyhow::Result<()> {
        let tool_uses = assistant.tool_use_count();
        if tool_uses == 0 {
            return Ok(());
        }
        if let Some(updated) = self
            .storage
            .update_session(&self.session_id, |session| {
                session.metadata.tool_call_count += tool_uses as u64;
            })
            .await?
        {
            self.publish_session_updated(&updated, "metadata");
        }
        Ok(())
    }

    async fn handle_user(&self, user: &UserMessage) -> anyhow::Result<()> {
        if carries_invalid_request_marker(user) {
            self.record_breaker_error().await;
        }
        Ok(())
    }

    async fn handle_result(&self, result: &ResultMessage) -> anyhow::Result<()> {
        let usage = result.usage.clone().unwrap_or_default();
        let reported = result.total_cost_usd.unwrap_or(0.0);

        let updated = self
            .storage
            .update_session(&self.session_id, |session| {
                let metadata = &mut session.metadata;
                metadata.input_tokens += usage.input_tokens;
                metadata.output_tokens += usage.output_tokens;
                metadata.total_tokens = metadata.input_tokens + metadata.output_tokens;
                // The engine reports a lifetime cost for its own session. A
                // drop means that counter restarted, so the old total moves
                // into the baseline before adding the new reading.
                if reported < metadata.last_sdk_cost {
                    metadata.cost_baseline += metadata.last_sdk_cost;
                }
                metadata.total_cost = metadata.cost_baseline + reported;
                metadata.last_sdk_cost = reported;
            })
            .await?;

        let model = updated.as_ref().and_then(|s| s.config.model.clone());
        self.tracker
            .update_from_usage(&usage, model.as_deref())
            .await;

        self.queue.enqueue("/context", true).await;

        if let Some(updated) = updated {
            self.publish_session_updated(&updated, "metadata");
        }
        self.bus.publish(SessionEvent::new(
            "session.errorClear",
            json!({ "sessionID": self.session_id }),
        ));
        self.state.set_idle().await;
        Ok(())
    }

    /// Renders a failure as ordinary chat content: a synthetic assistant
    /// message that is persisted and broadcast like any other.
    pub async fn display_error_as_assistant_message(
        &self,
        text: &str,
        mark_as_error: bool,
    ) -> anyhow::Result<()> {
        let message = EngineMessage::Assistant(AssistantMessage::from_text(
            &self.session_id,
            text,
            mark_as_error,
        ));
        let inserted = self
            .storage
            .append_message(StoredMessage::new(
                &self.session_id,
                message.clone(),
                MessageStatus::Sent,
            ))
            .await?;
        if inserted {
            self.hub.publish_to_session(
                &self.session_id,
                "message.delta",
                serde_json::to_value(&message)?,
            );
        }
        Ok(())
    }

    /// Clears the consecutive-error window after a turn completed normally.
    /// Any armed cooldown timer is disarmed too; a stale timer from an old
    /// trip must not zero a streak building after this success.
    pub async fn mark_api_success(&self) {
        let mut breaker = self.breaker.lock().await;
        breaker.consecutive = 0;
        breaker.tripped = false;
        if let Some(cooldown) = breaker.cooldown.take() {
            cooldown.abort();
        }
    }

    /// Full reset, including the armed cooldown timer.
    pub async fn reset_circuit_breaker(&self) {
        let mut breaker = self.breaker.lock().await;
        breaker.consecutive = 0;
        breaker.tripped = false;
        if let Some(cooldown) = breaker.cooldown.take() {
            cooldown.abort();
        }
    }

    pub async fn breaker_error_count(&self) -> u32 {
        self.breaker.lock().await.consecutive
    }

    pub async fn is_breaker_tripped(&self) -> bool {
        self.breaker.lock().await.tripped
    }

    async fn record_breaker_error(&self) {
        let should_trip = {
            let mut breaker = self.breaker.lock().await;
            if breaker.tripped {
                // One-shot: nothing repeats until a reset.
                return;
            }
            breaker.consecutive += 1;
            if breaker.consecutive > self.breaker_threshold {
                breaker.tripped = true;
                true
            } else {
                false
            }
        };
        if should_trip {
            self.trip_breaker().await;
        }
    }

    async fn trip_breaker(&self) {
        tracing::warn!(
            target: "tether.core",
            session_id = %self.session_id,
            threshold = self.breaker_threshold,
            "circuit breaker tripped, halting engine interaction"
        );

        if self.lifecycle.is_query_active().await {
            if let Err(error) = self.lifecycle.stop(true).await {
                tracing::warn!(
                    target: "tether.core",
                    session_id = %self.session_id,
                    error = %error,
                    "stopping query on breaker trip failed"
                );
            }
        }
        self.state.set_idle().await;
        self.queue.clear().await;
        if let Err(error) = self
            .display_error_as_assistant_message(BREAKER_NOTICE, true)
            .await
        {
            tracing::warn!(
                target: "tether.core",
                session_id = %self.session_id,
                error = %error,
                "persisting breaker notice failed"
            );
        }
        self.errors
            .handle_error_coded(
                &self.session_id,
                "circuit-breaker",
                "CIRCUIT_BREAKER_TRIPPED",
                "consecutive invalid-request errors exceeded the threshold",
            )
            .await;
        self.bus.publish(SessionEvent::new(
            "session.errorClear",
            json!({ "sessionID": self.session_id }),
        ));

        let breaker = self.breaker.clone();
        let cooldown_ms = self.breaker_cooldown_ms;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(cooldown_ms)).await;
            let mut breaker = breaker.lock().await;
            breaker.consecutive = 0;
            breaker.tripped = false;
            breaker.cooldown = None;
        });
        let mut breaker = self.breaker.lock().await;
        if let Some(previous) = breaker.cooldown.take() {
            previous.abort();
        }
        breaker.cooldown = Some(handle);
    }

    fn publish_session_updated(&self, session: &Session, source: &str) {
        self.bus.publish(SessionEvent::new(
            "session.updated",
            json!({
                "sessionID": self.session_id,
                "source": source,
                "session": session,
            }),
        ));
    }
}

fn carries_invalid_request_marker(user: &UserMessage) -> bool {
    if is_invalid_request_error(&user.message.content.plain_text()) {
        return true;
    }
    user.message.content.blocks().iter().any(|block| match block {
        ContentBlock::ToolResult { content, .. } => match content.as_str() {
            Some(text) => is_invalid_request_error(text),
            None => is_invalid_request_error(&content.to_string()),
        },
        _ => false,
    })
}
