use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use tether_agent::{AgentEngine, ToolGate};
use tether_types::{
    new_message_id, ContextBreakdown, EngineMessage, MessageBody, MessageContent, ProcessingState,
    Session, SessionConfig, SessionEvent, UserMessage,
};

use crate::ask_user::{AskUserQuestionHandler, QuestionRequest};
use crate::config::SessionDefaults;
use crate::context_tracker::ContextTracker;
use crate::error_manager::ErrorManager;
use crate::event_bus::EventBus;
use crate::handler::{MessageHandler, MessageHandlerDeps};
use crate::message_hub::MessageHub;
use crate::message_queue::MessageQueue;
use crate::processing_state::ProcessingStateManager;
use crate::query_runner::{
    GenerationCounter, InvocationHandle, QueryLifecycle, QueryRunner, QueryRunnerDeps,
};
use crate::storage::{MessageStatus, Storage, StoredMessage};
use crate::{resolve_breaker_cooldown_ms, resolve_breaker_threshold, resolve_startup_timeout_ms};

/// Stops queries through the invocation slot so the handler's circuit
/// breaker and external interrupts share one code path.
pub struct SessionController {
    session_id: String,
    queue: Arc<MessageQueue>,
    state: Arc<ProcessingStateManager>,
    invocation: InvocationHandle,
}

#[async_trait]
impl QueryLifecycle for SessionController {
    async fn is_query_active(&self) -> bool {
        self.invocation.is_active().await
    }

    async fn stop(&self, catch_query_errors: bool) -> anyhow::Result<()> {
        self.queue.stop().await;
        if self.invocation.cancel_active().await {
            self.state.set_interrupted().await;
            return Ok(());
        }
        if catch_query_errors {
            tracing::debug!(
                target: "tether.core",
                session_id = %self.session_id,
                "stop requested with no active invocation"
            );
            return Ok(());
        }
        Err(anyhow!("no active query to stop"))
    }
}

/// Everything one live session needs: queue, state, context, questions,
/// handler, and runner, all sharing the same storage and buses.
pub struct SessionOrchestrator {
    session_id: String,
    queue: Arc<MessageQueue>,
    state: Arc<ProcessingStateManager>,
    tracker: Arc<ContextTracker>,
    ask: AskUserQuestionHandler,
    controller: Arc<SessionController>,
    handler: Arc<MessageHandler>,
    runner: Arc<QueryRunner>,
    lifetime: CancellationToken,
    turn_lock: Mutex<()>,
}

impl SessionOrchestrator {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub fn state_manager(&self) -> &Arc<ProcessingStateManager> {
        &self.state
    }

    pub fn context_tracker(&self) -> &Arc<ContextTracker> {
        &self.tracker
    }

    pub fn ask(&self) -> &AskUserQuestionHandler {
        &self.ask
    }

    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    pub fn handler(&self) -> &Arc<MessageHandler> {
        &self.handler
    }

    pub fn runner(&self) -> &Arc<QueryRunner> {
        &self.runner
    }
}

pub struct RuntimeOptions {
    pub defaults: SessionDefaults,
    pub startup_timeout_ms: u64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            defaults: SessionDefaults::default(),
            startup_timeout_ms: resolve_startup_timeout_ms(),
            breaker_threshold: resolve_breaker_threshold(),
            breaker_cooldown_ms: resolve_breaker_cooldown_ms(),
        }
    }
}

/// Registry of live sessions. Orchestrators are built lazily on first use,
/// so sessions hydrated from disk attach the same way new ones do.
pub struct SessionRuntime {
    storage: Arc<Storage>,
    engine: Arc<dyn AgentEngine>,
    bus: EventBus,
    hub: MessageHub,
    errors: Arc<ErrorManager>,
    options: RuntimeOptions,
    sessions: RwLock<HashMap<String, Arc<SessionOrchestrator>>>,
}

impl SessionRuntime {
    pub fn new(
        storage: Arc<Storage>,
        engine: Arc<dyn AgentEngine>,
        bus: EventBus,
        hub: MessageHub,
        options: RuntimeOptions,
    ) -> Self {
        let errors = Arc::new(ErrorManager::new(bus.clone()));
        Self {
            storage,
            engine,
            bus,
            hub,
            errors,
            options,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn hub(&self) -> &MessageHub {
        &self.hub
    }

    pub fn errors(&self) -> &Arc<ErrorManager> {
        &self.errors
    }

    pub async fn create_session(
        &self,
        title: Option<String>,
        workspace: impl Into<String>,
        config: Option<SessionConfig>,
    ) -> anyhow::Result<Session> {
        let session = self.storage.create_session(title, workspace, config).await?;
        self.attach_session(&session.id).await?;
        Ok(session)
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        self.storage.list_sessions().await
    }

    /// Returns the live orchestrator for a stored session, building it on
    /// first use.
    pub async fn attach_session(
        &self,
        session_id: &str,
    ) -> anyhow::Result<Arc<SessionOrchestrator>> {
        if let Some(existing) = self.sessions.read().await.get(session_id) {
            return Ok(existing.clone());
        }
        if self.storage.get_session(session_id).await.is_none() {
            return Err(anyhow!("unknown session {session_id}"));
        }

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(session_id) {
            return Ok(existing.clone());
        }

        let queue = Arc::new(MessageQueue::new());
        let state = Arc::new(ProcessingStateManager::new());
        let tracker = Arc::new(ContextTracker::new());
        let invocation = InvocationHandle::new();
        let lifetime = CancellationToken::new();
        let ask = AskUserQuestionHandler::new(session_id, self.bus.clone(), lifetime.clone());

        let controller = Arc::new(SessionController {
            session_id: session_id.to_string(),
            queue: queue.clone(),
            state: state.clone(),
            invocation: invocation.clone(),
        });

        let handler = Arc::new(MessageHandler::new(MessageHandlerDeps {
            session_id: session_id.to_string(),
            storage: self.storage.clone(),
            bus: self.bus.clone(),
            hub: self.hub.clone(),
            queue: queue.clone(),
            state: state.clone(),
            tracker: tracker.clone(),
            errors: self.errors.clone(),
            lifecycle: controller.clone(),
            breaker_threshold: self.options.breaker_threshold,
            breaker_cooldown_ms: self.options.breaker_cooldown_ms,
        }));

        let gate: Arc<dyn ToolGate> = Arc::new(ask.clone());
        let runner = Arc::new(QueryRunner::new(QueryRunnerDeps {
            session_id: session_id.to_string(),
            engine: self.engine.clone(),
            storage: self.storage.clone(),
            queue: queue.clone(),
            state: state.clone(),
            handler: handler.clone(),
            errors: self.errors.clone(),
            generation: GenerationCounter::new(),
            invocation,
            gate,
            defaults: self.options.defaults.clone(),
            startup_timeout_ms: self.options.startup_timeout_ms,
        }));

        let orchestrator = Arc::new(SessionOrchestrator {
            session_id: session_id.to_string(),
            queue,
            state,
            tracker,
            ask,
            controller,
            handler,
            runner,
            lifetime,
            turn_lock: Mutex::new(()),
        });
        sessions.insert(session_id.to_string(), orchestrator.clone());
        Ok(orchestrator)
    }

    /// Accepts one user turn: persists it, flushes every pending turn into
    /// the queue, and makes sure a query is running to consume them.
    pub async fn submit_turn(&self, session_id: &str, text: &str) -> anyhow::Result<String> {
        let orchestrator = self.attach_session(session_id).await?;

        // Persist, pending flush, and the queued-state update form one
        // compound step per session; concurrent submits serialize here so
        // two of them can never flush the same pending turn.
        let _turn = orchestrator.turn_lock.lock().await;

        let message = EngineMessage::User(UserMessage {
            id: new_message_id(),
            session_id: Some(session_id.to_string()),
            parent_tool_use_id: None,
            message: MessageBody {
                role: Some("user".to_string()),
                model: None,
                content: MessageContent::Text(text.to_string()),
            },
            synthetic: false,
            replay: false,
        });
        let message_id = message.id().to_string();

        // Persist before queueing so an ill-timed crash cannot lose the turn.
        let inserted = self
            .storage
            .append_message(StoredMessage::new(
                session_id,
                message.clone(),
                MessageStatus::Pending,
            ))
            .await?;
        if inserted {
            self.hub.publish_to_session(
                session_id,
                "message.delta",
                serde_json::to_value(&message)?,
            );
        }

        let pending = self
            .storage
            .get_messages_by_status(session_id, MessageStatus::Pending)
            .await;
        let mut flushed = Vec::new();
        for stored in pending {
            let text = match &stored.message {
                EngineMessage::User(user) => user.message.content.plain_text(),
                _ => continue,
            };
            orchestrator
                .queue
                .enqueue_with_id(stored.id.clone(), text, false)
                .await;
            self.storage
                .update_message_status(session_id, &stored.id, MessageStatus::Sent)
                .await?;
            flushed.push(stored.id);
        }
        if !flushed.is_empty() {
            self.bus.publish(SessionEvent::new(
                "messages.statusChanged",
                json!({
                    "sessionID": session_id,
                    "messageIDs": flushed,
                    "status": "sent",
                }),
            ));
        }

        let current = orchestrator.state.state().await;
        if matches!(
            current,
            ProcessingState::Idle | ProcessingState::Interrupted
        ) {
            orchestrator.state.set_queued(&message_id).await;
        }

        if !orchestrator.queue.is_running().await {
            let runner = orchestrator.runner.clone();
            tokio::spawn(async move { runner.start().await });
        }
        Ok(message_id)
    }

    /// Interrupts the active query. Pending queue items survive for the next
    /// start.
    pub async fn interrupt(&self, session_id: &str) -> anyhow::Result<()> {
        let orchestrator = self.attach_session(session_id).await?;
        orchestrator.controller.stop(false).await
    }

    pub async fn processing_state(&self, session_id: &str) -> anyhow::Result<ProcessingState> {
        let orchestrator = self.attach_session(session_id).await?;
        Ok(orchestrator.state.state().await)
    }

    pub async fn is_compacting(&self, session_id: &str) -> anyhow::Result<bool> {
        let orchestrator = self.attach_session(session_id).await?;
        Ok(orchestrator.state.is_compacting().await)
    }

    pub async fn context(&self, session_id: &str) -> anyhow::Result<ContextBreakdown> {
        let orchestrator = self.attach_session(session_id).await?;
        Ok(orchestrator.tracker.current().await)
    }

    pub async fn pending_questions(
        &self,
        session_id: &str,
    ) -> anyhow::Result<Vec<QuestionRequest>> {
        let orchestrator = self.attach_session(session_id).await?;
        Ok(orchestrator.ask.list_pending().await)
    }

    pub async fn answer_question(
        &self,
        session_id: &str,
        request_id: &str,
        answer: &str,
    ) -> anyhow::Result<bool> {
        let orchestrator = self.attach_session(session_id).await?;
        Ok(orchestrator.ask.reply(request_id, answer).await)
    }

    pub async fn reset_breaker(&self, session_id: &str) -> anyhow::Result<()> {
        let orchestrator = self.attach_session(session_id).await?;
        orchestrator.handler.reset_circuit_breaker().await;
        Ok(())
    }

    /// Detaches a session, interrupting any active query and releasing
    /// parked question waiters.
    pub async fn close_session(&self, session_id: &str) -> anyhow::Result<()> {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(orchestrator) = removed {
            orchestrator.controller.stop(true).await?;
            orchestrator.lifetime.cancel();
        }
        Ok(())
    }

    /// Shuts every live session down. Used on daemon exit.
    pub async fn stop_all(&self) {
        let orchestrators: Vec<_> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, orchestrator)| orchestrator).collect()
        };
        for orchestrator in orchestrators {
            if let Err(error) = orchestrator.controller.stop(true).await {
                tracing::warn!(
                    target: "tether.core",
                    session_id = %orchestrator.session_id,
                    error = %error,
                    "stopping session during shutdown failed"
                );
            }
            orchestrator.lifetime.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::time::Duration;

    use async_stream::stream;
    use futures::StreamExt;
    use tokio::sync::{mpsc, Mutex};
    use uuid::Uuid;

    use tether_agent::{EngineMessageStream, InvokeOptions, TurnInputStream};
    use tether_types::QueueItem;

    struct ScriptedEngine {
        scripts: Mutex<VecDeque<mpsc::UnboundedReceiver<anyhow::Result<EngineMessage>>>>,
        received: Arc<Mutex<Vec<QueueItem>>>,
    }

    impl ScriptedEngine {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(VecDeque::new()),
                received: Arc::new(Mutex::new(Vec::new())),
            })
        }

        async fn add_script(&self) -> mpsc::UnboundedSender<anyhow::Result<EngineMessage>> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.scripts.lock().await.push_back(rx);
            tx
        }

        async fn received_texts(&self) -> Vec<String> {
            self.received
                .lock()
                .await
                .iter()
                .map(|item| item.text.clone())
                .collect()
        }
    }

    #[async_trait]
    impl AgentEngine for ScriptedEngine {
        async fn invoke(
            &self,
            input: TurnInputStream,
            _options: InvokeOptions,
            cancel: CancellationToken,
        ) -> anyhow::Result<EngineMessageStream> {
            let mut script = self
                .scripts
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| anyhow!("no scripted invocation left"))?;
            let received = self.received.clone();
            tokio::spawn(async move {
                let mut input = input;
                while let Some(item) = input.next().await {
                    received.lock().await.push(item);
                }
            });
            let stream = stream! {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        item = script.recv() => match item {
                            Some(item) => yield item,
                            None => break,
                        }
                    }
                }
            };
            Ok(Box::pin(stream))
        }
    }

    struct Harness {
        runtime: Arc<SessionRuntime>,
        engine: Arc<ScriptedEngine>,
        dir: PathBuf,
    }

    impl Harness {
        async fn new() -> Self {
            let dir =
                std::env::temp_dir().join(format!("tether-core-test-{}", Uuid::new_v4()));
            let storage = Arc::new(Storage::new(&dir).await.expect("storage init"));
            let engine = ScriptedEngine::new();
            let runtime = Arc::new(SessionRuntime::new(
                storage,
                engine.clone(),
                EventBus::new(),
                MessageHub::new(),
                RuntimeOptions {
                    defaults: SessionDefaults::default(),
                    startup_timeout_ms: 5_000,
                    breaker_threshold: 3,
                    breaker_cooldown_ms: 60_000,
                },
            ));
            Self {
                runtime,
                engine,
                dir,
            }
        }

        fn cleanup(&self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    async fn wait_for<F, Fut>(mut predicate: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if predicate().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn submit_turn_delivers_the_turn_to_the_engine() {
        let harness = Harness::new().await;
        let _script = harness.engine.add_script().await;
        let mut events = harness.runtime.bus().subscribe();

        let session = harness
            .runtime
            .create_session(Some("runtime test".to_string()), "", None)
            .await
            .expect("create session");
        let message_id = harness
            .runtime
            .submit_turn(&session.id, "hello engine")
            .await
            .expect("submit turn");

        let engine = harness.engine.clone();
        wait_for(|| {
            let engine = engine.clone();
            async move { engine.received_texts().await == vec!["hello engine".to_string()] }
        })
        .await;

        let stored = harness.runtime.storage().get_messages(&session.id).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, message_id);
        assert_eq!(stored[0].status, MessageStatus::Sent);

        let mut saw_status_change = false;
        while let Ok(event) = events.try_recv() {
            if event.event_type == "messages.statusChanged" {
                assert_eq!(event.properties["messageIDs"][0], message_id.as_str());
                saw_status_change = true;
            }
        }
        assert!(saw_status_change);
        harness.cleanup();
    }

    #[tokio::test]
    async fn pending_turns_flush_in_arrival_order() {
        let harness = Harness::new().await;
        let _script = harness.engine.add_script().await;

        let session = harness
            .runtime
            .create_session(None, "", None)
            .await
            .expect("create session");

        // A turn stranded in pending state, as after a crash mid-submit.
        let stranded = EngineMessage::User(UserMessage {
            id: new_message_id(),
            session_id: Some(session.id.clone()),
            parent_tool_use_id: None,
            message: MessageBody {
                role: Some("user".to_string()),
                model: None,
                content: MessageContent::Text("first".to_string()),
            },
            synthetic: false,
            replay: false,
        });
        harness
            .runtime
            .storage()
            .append_message(StoredMessage::new(
                &session.id,
                stranded,
                MessageStatus::Pending,
            ))
            .await
            .expect("seed pending");

        harness
            .runtime
            .submit_turn(&session.id, "second")
            .await
            .expect("submit turn");

        let engine = harness.engine.clone();
        wait_for(|| {
            let engine = engine.clone();
            async move {
                engine.received_texts().await
                    == vec!["first".to_string(), "second".to_string()]
            }
        })
        .await;

        let still_pending = harness
            .runtime
            .storage()
            .get_messages_by_status(&session.id, MessageStatus::Pending)
            .await;
        assert!(still_pending.is_empty());
        harness.cleanup();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submits_deliver_each_turn_exactly_once() {
        let harness = Harness::new().await;
        let _script = harness.engine.add_script().await;

        let session = harness
            .runtime
            .create_session(None, "", None)
            .await
            .expect("create session");

        let barrier = Arc::new(tokio::sync::Barrier::new(4));
        let mut submitters = Vec::new();
        for index in 0..4 {
            let runtime = harness.runtime.clone();
            let session_id = session.id.clone();
            let barrier = barrier.clone();
            submitters.push(tokio::spawn(async move {
                barrier.wait().await;
                runtime
                    .submit_turn(&session_id, &format!("turn {index}"))
                    .await
            }));
        }
        for submitter in submitters {
            submitter.await.expect("submit task").expect("submit turn");
        }

        let engine = harness.engine.clone();
        wait_for(|| {
            let engine = engine.clone();
            async move { engine.received_texts().await.len() >= 4 }
        })
        .await;

        // Leave room for a duplicate flush to surface before counting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let texts = harness.engine.received_texts().await;
        assert_eq!(texts.len(), 4);
        for index in 0..4 {
            let expected = format!("turn {index}");
            assert_eq!(texts.iter().filter(|text| **text == expected).count(), 1);
        }

        let still_pending = harness
            .runtime
            .storage()
            .get_messages_by_status(&session.id, MessageStatus::Pending)
            .await;
        assert!(still_pending.is_empty());
        harness.cleanup();
    }

    #[tokio::test]
    async fn interrupt_parks_the_session_until_the_next_turn() {
        let harness = Harness::new().await;
        let _script = harness.engine.add_script().await;

        let session = harness
            .runtime
            .create_session(None, "", None)
            .await
            .expect("create session");
        harness
            .runtime
            .submit_turn(&session.id, "long running request")
            .await
            .expect("submit turn");

        let orchestrator = harness
            .runtime
            .attach_session(&session.id)
            .await
            .expect("attach");
        let controller = orchestrator.controller().clone();
        wait_for(|| {
            let controller = controller.clone();
            async move { controller.is_query_active().await }
        })
        .await;

        harness
            .runtime
            .interrupt(&session.id)
            .await
            .expect("interrupt");

        assert_eq!(
            harness
                .runtime
                .processing_state(&session.id)
                .await
                .expect("state"),
            ProcessingState::Interrupted
        );
        assert!(!orchestrator.queue().is_running().await);
        assert!(!controller.is_query_active().await);

        // The next turn leaves the interrupted state behind.
        let _script = harness.engine.add_script().await;
        harness
            .runtime
            .submit_turn(&session.id, "again")
            .await
            .expect("second turn");
        let after = harness
            .runtime
            .processing_state(&session.id)
            .await
            .expect("state");
        assert_ne!(after, ProcessingState::Interrupted);
        harness.cleanup();
    }

    #[tokio::test]
    async fn interrupt_without_an_active_query_fails() {
        let harness = Harness::new().await;
        let session = harness
            .runtime
            .create_session(None, "", None)
            .await
            .expect("create session");

        let result = harness.runtime.interrupt(&session.id).await;
        assert!(result.is_err());
        harness.cleanup();
    }

    #[tokio::test]
    async fn attach_rejects_unknown_sessions() {
        let harness = Harness::new().await;
        assert!(harness.runtime.attach_session("ses_missing").await.is_err());
        harness.cleanup();
    }
}
