use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use tether_agent::{AgentEngine, InvokeOptions, ToolGate, TurnInputStream};
use tether_types::ProcessingPhase;

use crate::config::SessionDefaults;
use crate::error_manager::ErrorManager;
use crate::handler::MessageHandler;
use crate::message_queue::MessageQueue;
use crate::processing_state::ProcessingStateManager;
use crate::query_options::QueryOptionsBuilder;
use crate::storage::Storage;

/// Seam for stopping an in-flight query without reaching into the runner.
#[async_trait]
pub trait QueryLifecycle: Send + Sync {
    async fn is_query_active(&self) -> bool;

    /// Stops the active query. With `catch_query_errors` set, stop failures
    /// are reported and swallowed instead of propagated.
    async fn stop(&self, catch_query_errors: bool) -> anyhow::Result<()>;
}

/// Monotonic run identifier shared between the runner and whoever may
/// supersede it. A completion is only allowed to settle session state when
/// its own generation is still the current one.
#[derive(Clone, Default)]
pub struct GenerationCounter {
    current: Arc<AtomicU64>,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn advance(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Shared slot holding the cancellation token of the active invocation.
#[derive(Clone, Default)]
pub struct InvocationHandle {
    cancel: Arc<Mutex<Option<CancellationToken>>>,
}

impl InvocationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: CancellationToken) {
        *self.cancel.lock().await = Some(token);
    }

    pub async fn clear(&self) {
        *self.cancel.lock().await = None;
    }

    pub async fn is_active(&self) -> bool {
        self.cancel.lock().await.is_some()
    }

    /// Cancels and clears the active invocation. Returns false when nothing
    /// was running.
    pub async fn cancel_active(&self) -> bool {
        match self.cancel.lock().await.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

enum RunOutcome {
    Completed,
    Cancelled,
    StartupStalled,
    Failed(anyhow::Error),
}

pub struct QueryRunnerDeps {
    pub session_id: String,
    pub engine: Arc<dyn AgentEngine>,
    pub storage: Arc<Storage>,
    pub queue: Arc<MessageQueue>,
    pub state: Arc<ProcessingStateManager>,
    pub handler: Arc<MessageHandler>,
    pub errors: Arc<ErrorManager>,
    pub generation: GenerationCounter,
    pub invocation: InvocationHandle,
    pub gate: Arc<dyn ToolGate>,
    pub defaults: SessionDefaults,
    pub startup_timeout_ms: u64,
}

/// Owns one session's engine invocations: builds options from session state,
/// feeds the queue's pull stream to the engine, routes every output message
/// through the handler, and settles terminal state exactly once.
pub struct QueryRunner {
    session_id: String,
    engine: Arc<dyn AgentEngine>,
    storage: Arc<Storage>,
    queue: Arc<MessageQueue>,
    state: Arc<ProcessingStateManager>,
    handler: Arc<MessageHandler>,
    errors: Arc<ErrorManager>,
    generation: GenerationCounter,
    invocation: InvocationHandle,
    gate: Arc<dyn ToolGate>,
    defaults: SessionDefaults,
    startup_timeout_ms: u64,
}

impl QueryRunner {
    pub fn new(deps: QueryRunnerDeps) -> Self {
        Self {
            session_id: deps.session_id,
            engine: deps.engine,
            storage: deps.storage,
            queue: deps.queue,
            state: deps.state,
            handler: deps.handler,
            errors: deps.errors,
            generation: deps.generation,
            invocation: deps.invocation,
            gate: deps.gate,
            defaults: deps.defaults,
            startup_timeout_ms: deps.startup_timeout_ms,
        }
    }

    pub fn generation(&self) -> &GenerationCounter {
        &self.generation
    }

    /// Runs one query to completion. Every failure is handled here; nothing
    /// propagates to the caller, which is typically a detached task.
    pub async fn start(&self) {
        // The queue claim is the serialization point for concurrent starts:
        // exactly one caller wins it, and only the winner advances the
        // generation and invokes the engine.
        if !self.queue.try_start().await {
            tracing::debug!(
                target: "tether.core",
                session_id = %self.session_id,
                "query already active, leaving the running pull loop in place"
            );
            return;
        }

        let generation = self.generation.advance();
        self.state
            .set_processing(ProcessingPhase::Initializing)
            .await;

        let Some(session) = self.storage.get_session(&self.session_id).await else {
            self.errors
                .handle_error_text(
                    &self.session_id,
                    "query-runner",
                    "session disappeared before the query could start",
                )
                .await;
            self.queue.stop().await;
            self.state.set_idle().await;
            return;
        };

        let options = QueryOptionsBuilder::new(&self.defaults)
            .add_session_state_options(&session)
            .set_can_use_tool(self.gate.clone())
            .build();

        let cancel = CancellationToken::new();
        self.invocation.set(cancel.clone()).await;

        let input = self.queue.clone().message_generator().await;
        let outcome = self.drive(input, options, cancel.clone()).await;
        self.settle(generation, outcome, &cancel).await;
    }

    async fn drive(
        &self,
        input: TurnInputStream,
        options: InvokeOptions,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let mut stream = match self.engine.invoke(input, options, cancel.clone()).await {
            Ok(stream) => stream,
            Err(error) => return RunOutcome::Failed(error),
        };

        // The stall watchdog is armed only until the first message arrives.
        let mut first_received = false;
        let startup = tokio::time::sleep(Duration::from_millis(self.startup_timeout_ms));
        tokio::pin!(startup);

        loop {
            let next = tokio::select! {
                _ = startup.as_mut(), if !first_received => return RunOutcome::StartupStalled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(message)) => {
                    first_received = true;
                    if let Err(error) = self.handler.handle_message(message).await {
                        self.errors
                            .handle_error(&self.session_id, "message-handler", &error)
                            .await;
                    }
                }
                Some(Err(error)) => {
                    if cancel.is_cancelled() {
                        return RunOutcome::Cancelled;
                    }
                    return RunOutcome::Failed(error);
                }
                None => {
                    return if cancel.is_cancelled() {
                        RunOutcome::Cancelled
                    } else {
                        RunOutcome::Completed
                    };
                }
            }
        }
    }

    async fn settle(&self, generation: u64, outcome: RunOutcome, cancel: &CancellationToken) {
        if self.generation.current() != generation {
            // A newer start owns the session bookkeeping now. Touch nothing.
            tracing::debug!(
                target: "tether.core",
                session_id = %self.session_id,
                generation,
                "discarding completion of a superseded query"
            );
            return;
        }

        self.invocation.clear().await;
        self.queue.stop().await;

        match outcome {
            RunOutcome::Completed => {
                self.handler.mark_api_success().await;
                self.state.set_idle().await;
            }
            RunOutcome::Cancelled => {
                // Whoever cancelled already chose the terminal state.
            }
            RunOutcome::StartupStalled => {
                cancel.cancel();
                self.errors
                    .handle_error_coded(
                        &self.session_id,
                        "query-runner",
                        "QUERY_STARTUP_TIMEOUT",
                        "engine produced no output before the startup deadline",
                    )
                    .await;
                self.state.set_idle().await;
            }
            RunOutcome::Failed(error) => {
                self.errors
                    .handle_error(&self.session_id, "query-runner", &error)
                    .await;
                self.state.set_idle().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    use async_stream::stream;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use tether_agent::{EngineMessageStream, ToolDecision};
    use tether_types::{
        EngineMessage, MessageBody, MessageContent, ProcessingState, SystemMessage, SystemSubtype,
        UserMessage,
    };

    use crate::context_tracker::ContextTracker;
    use crate::event_bus::EventBus;
    use crate::handler::MessageHandlerDeps;
    use crate::message_hub::MessageHub;

    struct FakeEngine {
        scripts: Mutex<VecDeque<mpsc::UnboundedReceiver<anyhow::Result<EngineMessage>>>>,
        invocations: AtomicUsize,
    }

    impl FakeEngine {
        fn with_script() -> (Arc<Self>, mpsc::UnboundedSender<anyhow::Result<EngineMessage>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let engine = Arc::new(Self {
                scripts: Mutex::new(VecDeque::from([rx])),
                invocations: AtomicUsize::new(0),
            });
            (engine, tx)
        }

        fn invocation_count(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AgentEngine for FakeEngine {
        async fn invoke(
            &self,
            input: TurnInputStream,
            _options: InvokeOptions,
            cancel: CancellationToken,
        ) -> anyhow::Result<EngineMessageStream> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let mut script = self
                .scripts
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no scripted invocation left"))?;
            tokio::spawn(async move {
                let mut input = input;
                while input.next().await.is_some() {}
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

    struct AllowAllGate;

    #[async_trait]
    impl ToolGate for AllowAllGate {
        async fn can_use_tool(&self, _tool_name: &str, _input: &Value) -> ToolDecision {
            ToolDecision::Allow {
                updated_input: None,
            }
        }
    }

    struct NoopLifecycle;

    #[async_trait]
    impl QueryLifecycle for NoopLifecycle {
        async fn is_query_active(&self) -> bool {
            false
        }

        async fn stop(&self, _catch_query_errors: bool) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Harness {
        runner: Arc<QueryRunner>,
        queue: Arc<MessageQueue>,
        state: Arc<ProcessingStateManager>,
        handler: Arc<MessageHandler>,
        generation: GenerationCounter,
        invocation: InvocationHandle,
        bus: EventBus,
        session_id: String,
        dir: PathBuf,
    }

    impl Harness {
        async fn new(engine: Arc<FakeEngine>, startup_timeout_ms: u64) -> Self {
            let dir =
                std::env::temp_dir().join(format!("tether-core-test-{}", Uuid::new_v4()));
            let storage = Arc::new(Storage::new(&dir).await.expect("storage init"));
            let session = storage
                .create_session(Some("runner test".to_string()), "", None)
                .await
                .expect("create session");

            let bus = EventBus::new();
            let hub = MessageHub::new();
            let queue = Arc::new(MessageQueue::new());
            let state = Arc::new(ProcessingStateManager::new());
            let tracker = Arc::new(ContextTracker::new());
            let errors = Arc::new(ErrorManager::new(bus.clone()));
            let generation = GenerationCounter::new();
            let invocation = InvocationHandle::new();

            let handler = Arc::new(MessageHandler::new(MessageHandlerDeps {
                session_id: session.id.clone(),
                storage: storage.clone(),
                bus: bus.clone(),
                hub,
                queue: queue.clone(),
                state: state.clone(),
                tracker,
                errors: errors.clone(),
                lifecycle: Arc::new(NoopLifecycle),
                breaker_threshold: 3,
                breaker_cooldown_ms: 60_000,
            }));

            let runner = Arc::new(QueryRunner::new(QueryRunnerDeps {
                session_id: session.id.clone(),
                engine,
                storage,
                queue: queue.clone(),
                state: state.clone(),
                handler: handler.clone(),
                errors,
                generation: generation.clone(),
                invocation: invocation.clone(),
                gate: Arc::new(AllowAllGate),
                defaults: SessionDefaults::default(),
                startup_timeout_ms,
            }));

            Self {
                runner,
                queue,
                state,
                handler,
                generation,
                invocation,
                bus,
                session_id: session.id,
                dir,
            }
        }

        fn cleanup(&self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn init_message() -> EngineMessage {
        EngineMessage::System(SystemMessage {
            id: tether_types::new_message_id(),
            subtype: SystemSubtype::Init,
            session_id: Some("sdk-abc".to_string()),
            model: Some("sonnet".to_string()),
            status: None,
            compact_metadata: None,
        })
    }

    fn invalid_request_user_message() -> EngineMessage {
        EngineMessage::User(UserMessage {
            id: tether_types::new_message_id(),
            session_id: None,
            parent_tool_use_id: None,
            message: MessageBody {
                role: Some("user".to_string()),
                model: None,
                content: MessageContent::Text(
                    "API Error: 400 invalid_request_error, prompt is too long".to_string(),
                ),
            },
            synthetic: false,
            replay: false,
        })
    }

    async fn wait_until<F, Fut>(mut predicate: F)
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
    async fn start_is_ignored_while_a_query_is_running() {
        let (engine, _tx) = FakeEngine::with_script();
        let harness = Harness::new(engine.clone(), 5_000).await;

        harness.queue.start().await;
        let before = harness.generation.current();

        harness.runner.start().await;

        assert_eq!(harness.generation.current(), before);
        assert_eq!(engine.invocation_count(), 0);
        assert!(harness.queue.is_running().await);
        harness.cleanup();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_admit_exactly_one_query() {
        let (engine, tx) = FakeEngine::with_script();
        let harness = Harness::new(engine.clone(), 5_000).await;
        let barrier = Arc::new(tokio::sync::Barrier::new(6));

        let mut starters = Vec::new();
        for _ in 0..6 {
            let runner = harness.runner.clone();
            let barrier = barrier.clone();
            starters.push(tokio::spawn(async move {
                barrier.wait().await;
                runner.start().await;
            }));
        }

        // Five losers return straight away; the winner stays on the stream.
        wait_until(|| {
            let finished = starters.iter().filter(|s| s.is_finished()).count();
            async move { finished == 5 }
        })
        .await;

        assert_eq!(engine.invocation_count(), 1);
        assert_eq!(harness.generation.current(), 1);
        assert!(harness.queue.is_running().await);

        drop(tx);
        for starter in starters {
            starter.await.expect("start task");
        }
        assert_eq!(engine.invocation_count(), 1);
        assert_eq!(harness.state.state().await, ProcessingState::Idle);
        harness.cleanup();
    }

    #[tokio::test]
    async fn completed_run_settles_idle_and_clears_error_window() {
        let (engine, tx) = FakeEngine::with_script();
        let harness = Harness::new(engine, 5_000).await;

        let runner = harness.runner.clone();
        let task = tokio::spawn(async move { runner.start().await });

        tx.send(Ok(init_message())).expect("send init");
        tx.send(Ok(invalid_request_user_message()))
            .expect("send error 1");
        tx.send(Ok(invalid_request_user_message()))
            .expect("send error 2");

        let handler = harness.handler.clone();
        wait_until(|| {
            let handler = handler.clone();
            async move { handler.breaker_error_count().await == 2 }
        })
        .await;
        assert!(harness.state.state().await.is_processing());

        drop(tx);
        task.await.expect("runner task");

        assert_eq!(harness.state.state().await, ProcessingState::Idle);
        assert!(!harness.queue.is_running().await);
        assert!(!harness.invocation.is_active().await);
        assert_eq!(harness.handler.breaker_error_count().await, 0);
        harness.cleanup();
    }

    #[tokio::test]
    async fn superseded_completion_changes_nothing() {
        let (engine, tx) = FakeEngine::with_script();
        let harness = Harness::new(engine, 5_000).await;

        let runner = harness.runner.clone();
        let task = tokio::spawn(async move { runner.start().await });

        tx.send(Ok(init_message())).expect("send init");
        tx.send(Ok(invalid_request_user_message()))
            .expect("send error");

        let handler = harness.handler.clone();
        wait_until(|| {
            let handler = handler.clone();
            async move { handler.breaker_error_count().await == 1 }
        })
        .await;

        // Another start takes over the generation before this one finishes.
        harness.generation.advance();

        drop(tx);
        task.await.expect("runner task");

        assert!(harness.queue.is_running().await);
        assert!(harness.state.state().await.is_processing());
        assert!(harness.invocation.is_active().await);
        assert_eq!(harness.handler.breaker_error_count().await, 1);
        harness.cleanup();
    }

    #[tokio::test]
    async fn silent_engine_trips_the_startup_deadline() {
        let (engine, _tx) = FakeEngine::with_script();
        let harness = Harness::new(engine, 50).await;
        let mut events = harness.bus.subscribe();

        harness.runner.start().await;

        assert_eq!(harness.state.state().await, ProcessingState::Idle);
        assert!(!harness.queue.is_running().await);

        let mut saw_timeout = false;
        while let Ok(event) = events.try_recv() {
            if event.event_type == "session.error"
                && event.properties["code"] == "QUERY_STARTUP_TIMEOUT"
            {
                assert_eq!(event.properties["sessionID"], harness.session_id.as_str());
                saw_timeout = true;
            }
        }
        assert!(saw_timeout);
        harness.cleanup();
    }
}
