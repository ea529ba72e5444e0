use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use tether_agent::ProcessAgentEngine;
use tether_core::{ConfigStore, EventBus, MessageHub, RuntimeOptions, SessionRuntime, Storage};
use tether_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use tether_types::SessionStatus;

#[derive(Parser, Debug)]
#[command(name = "tetherd")]
#[command(about = "Persistent agent-session daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long)]
        state_dir: Option<String>,
        /// Engine CLI binary spawned for queries.
        #[arg(long)]
        engine_cmd: Option<String>,
        /// Extra argument passed to the engine CLI. Repeatable.
        #[arg(long = "engine-arg")]
        engine_args: Vec<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
    Sessions {
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            state_dir,
            engine_cmd,
            engine_args,
            model,
            config,
        } => {
            let overrides = build_cli_overrides(engine_cmd, engine_args, model);
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_process_logging(
                ProcessKind::Daemon,
                &logs_dir,
                resolve_log_retention_days(),
            )?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Daemon,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "daemon.main",
                    status: Some("ok"),
                    detail: Some("daemon jsonl logging initialized"),
                    ..Default::default()
                },
            );
            info!("daemon logging initialized: {:?}", log_info);

            let startup_attempt_id = Uuid::new_v4().to_string();
            log_startup_paths(&state_dir, &startup_attempt_id);

            let runtime = build_runtime(&state_dir, overrides, config.map(PathBuf::from)).await?;
            let session_count = runtime.list_sessions().await.len();
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Daemon,
                ObservabilityEvent {
                    event: "daemon.startup.ready",
                    component: "daemon.main",
                    status: Some("ok"),
                    detail: Some(&format!(
                        "attempt_id={startup_attempt_id} sessions={session_count}"
                    )),
                    ..Default::default()
                },
            );
            info!("tetherd ready, {session_count} stored sessions");

            spawn_event_logger(&runtime);

            tokio::signal::ctrl_c().await?;
            info!("shutdown signal received, stopping sessions");
            runtime.stop_all().await;
        }
        Command::Sessions { state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_process_logging(
                ProcessKind::Cli,
                &logs_dir,
                resolve_log_retention_days(),
            )?;
            tracing::debug!("cli logging initialized: {:?}", log_info);

            let storage = Storage::new(state_dir.join("storage")).await?;
            let sessions = storage.list_sessions().await;
            if sessions.is_empty() {
                println!("no stored sessions under {}", state_dir.display());
                return Ok(());
            }
            for session in sessions {
                let marker = match session.status {
                    SessionStatus::Active => "",
                    SessionStatus::Archived => "  [archived]",
                };
                println!(
                    "{}  {}  ${:.4}  {}{}",
                    session.id,
                    session.time.updated.format("%Y-%m-%d %H:%M"),
                    session.metadata.total_cost,
                    session.title.as_deref().unwrap_or("(untitled)"),
                    marker,
                );
            }
        }
    }

    Ok(())
}

fn build_cli_overrides(
    engine_cmd: Option<String>,
    engine_args: Vec<String>,
    model: Option<String>,
) -> Option<serde_json::Value> {
    if engine_cmd.is_none() && engine_args.is_empty() && model.is_none() {
        return None;
    }
    let mut root = serde_json::Map::new();

    let mut engine = serde_json::Map::new();
    if let Some(cmd) = engine_cmd {
        engine.insert("command".to_string(), serde_json::Value::String(cmd));
    }
    if !engine_args.is_empty() {
        engine.insert(
            "args".to_string(),
            serde_json::Value::Array(
                engine_args
                    .into_iter()
                    .map(serde_json::Value::String)
                    .collect(),
            ),
        );
    }
    if !engine.is_empty() {
        root.insert("engine".to_string(), serde_json::Value::Object(engine));
    }
    if let Some(model) = model {
        root.insert("session".to_string(), serde_json::json!({ "model": model }));
    }
    Some(serde_json::Value::Object(root))
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("TETHER_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .map(|dir| dir.join("tether"))
        .unwrap_or_else(|| PathBuf::from(".tether"))
}

fn resolve_log_retention_days() -> u64 {
    std::env::var("TETHER_LOG_RETENTION_DAYS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(14)
        .clamp(1, 365)
}

fn log_startup_paths(state_dir: &Path, startup_attempt_id: &str) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!(
        "startup paths: attempt_id={} exe={} cwd={} state_dir={} config_path={}",
        startup_attempt_id,
        exe.display(),
        cwd.display(),
        state_dir.display(),
        state_dir.join("config.json").display()
    );
}

async fn build_runtime(
    state_dir: &Path,
    cli_overrides: Option<serde_json::Value>,
    override_config_path: Option<PathBuf>,
) -> anyhow::Result<Arc<SessionRuntime>> {
    let startup = Instant::now();

    let phase_start = Instant::now();
    let storage = Arc::new(Storage::new(state_dir.join("storage")).await?);
    info!(
        "daemon.startup.phase storage_init elapsed_ms={}",
        phase_start.elapsed().as_millis()
    );

    let phase_start = Instant::now();
    let config_path = override_config_path.unwrap_or_else(|| state_dir.join("config.json"));
    let config = ConfigStore::new(config_path, cli_overrides).await?;
    let app = config.get().await;
    info!(
        "daemon.startup.phase config_init elapsed_ms={}",
        phase_start.elapsed().as_millis()
    );

    let phase_start = Instant::now();
    let engine_command = app
        .engine
        .command
        .clone()
        .unwrap_or_else(|| "claude".to_string());
    let engine = Arc::new(ProcessAgentEngine::new(
        engine_command,
        app.engine.args.clone(),
    ));
    let mut defaults = app.session.clone();
    if defaults.model.is_none() {
        defaults.model = app.engine.default_model.clone();
    }
    let runtime = Arc::new(SessionRuntime::new(
        storage,
        engine,
        EventBus::new(),
        MessageHub::new(),
        RuntimeOptions {
            defaults,
            ..RuntimeOptions::default()
        },
    ));
    info!(
        "daemon.startup.phase runtime_init elapsed_ms={}",
        phase_start.elapsed().as_millis()
    );
    info!(
        "daemon.startup.phase runtime_build_complete elapsed_ms={}",
        startup.elapsed().as_millis()
    );
    Ok(runtime)
}

fn spawn_event_logger(runtime: &Arc<SessionRuntime>) {
    let mut events = runtime.bus().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    tracing::debug!(
                        target: "tether.daemon",
                        event_type = %event.event_type,
                        "bus event"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "tether.daemon", skipped, "event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
