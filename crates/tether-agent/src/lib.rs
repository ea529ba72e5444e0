use std::fmt;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use tether_types::{EngineMessage, QueueItem};

pub type EngineMessageStream = Pin<Box<dyn Stream<Item = anyhow::Result<EngineMessage>> + Send>>;
pub type TurnInputStream = Pin<Box<dyn Stream<Item = QueueItem> + Send>>;

/// Outcome of a tool permission check requested by the engine mid-turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolDecision {
    Allow { updated_input: Option<Value> },
    Deny { reason: String },
}

#[async_trait]
pub trait ToolGate: Send + Sync {
    async fn can_use_tool(&self, tool_name: &str, input: &Value) -> ToolDecision;
}

#[derive(Clone, Default)]
pub struct InvokeOptions {
    pub model: Option<String>,
    pub resume_session_id: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub workspace: Option<String>,
    pub tool_gate: Option<Arc<dyn ToolGate>>,
}

impl fmt::Debug for InvokeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokeOptions")
            .field("model", &self.model)
            .field("resume_session_id", &self.resume_session_id)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("workspace", &self.workspace)
            .field("tool_gate", &self.tool_gate.is_some())
            .finish()
    }
}

/// Seam between the orchestration layer and the external agent engine. One
/// invocation consumes a stream of user turns and yields engine messages
/// until the engine finishes or is cancelled.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    async fn invoke(
        &self,
        input: TurnInputStream,
        options: InvokeOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<EngineMessageStream>;
}

#[derive(Debug, Clone, Deserialize)]
struct ControlRequest {
    request_id: String,
    request: ControlBody,
}

#[derive(Debug, Clone, Deserialize)]
struct ControlBody {
    subtype: String,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    input: Value,
}

enum EngineLine {
    Message(Box<EngineMessage>),
    Control(ControlRequest),
    Skip,
}

fn classify_line(line: &str) -> EngineLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return EngineLine::Skip;
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return EngineLine::Skip;
    };
    match value.get("type").and_then(|v| v.as_str()) {
        Some("control_request") => match serde_json::from_value::<ControlRequest>(value) {
            Ok(request) => EngineLine::Control(request),
            Err(_) => EngineLine::Skip,
        },
        Some("system" | "assistant" | "user" | "result") => {
            match serde_json::from_value::<EngineMessage>(value) {
                Ok(message) => EngineLine::Message(Box::new(message)),
                Err(_) => EngineLine::Skip,
            }
        }
        _ => EngineLine::Skip,
    }
}

fn turn_to_wire_line(item: &QueueItem) -> anyhow::Result<String> {
    let value = json!({
        "type": "user",
        "id": item.id,
        "message": { "role": "user", "content": item.text },
        "is_command": item.is_command,
    });
    Ok(serde_json::to_string(&value)?)
}

fn control_response_line(request_id: &str, decision: &ToolDecision) -> String {
    let body = match decision {
        ToolDecision::Allow { updated_input } => json!({
            "behavior": "allow",
            "updated_input": updated_input,
        }),
        ToolDecision::Deny { reason } => json!({
            "behavior": "deny",
            "reason": reason,
        }),
    };
    json!({
        "type": "control_response",
        "response": { "request_id": request_id, "subtype": "success", "body": body },
    })
    .to_string()
}

/// Engine client that shells out to the agent CLI and speaks JSONL over
/// stdin/stdout. One child process per invocation.
#[derive(Debug, Clone)]
pub struct ProcessAgentEngine {
    command: String,
    args: Vec<String>,
}

impl ProcessAgentEngine {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl AgentEngine for ProcessAgentEngine {
    async fn invoke(
        &self,
        input: TurnInputStream,
        options: InvokeOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<EngineMessageStream> {
        let mut command = Command::new(&self.command);
        command.args(&self.args);
        if let Some(model) = &options.model {
            command.arg("--model").arg(model);
        }
        if let Some(resume) = &options.resume_session_id {
            command.arg("--resume").arg(resume);
        }
        if let Some(max_tokens) = options.max_tokens {
            command.arg("--max-tokens").arg(max_tokens.to_string());
        }
        if let Some(temperature) = options.temperature {
            command.arg("--temperature").arg(temperature.to_string());
        }
        if let Some(workspace) = &options.workspace {
            command.current_dir(workspace);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("stderr unavailable"))?;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "tether.engine", line = %line, "engine stderr");
            }
        });

        let (control_tx, mut control_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut input = input;
            let mut stdin = stdin;
            loop {
                let line = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    Some(line) = control_rx.recv() => line,
                    item = input.next() => match item {
                        Some(item) => match turn_to_wire_line(&item) {
                            Ok(line) => line,
                            Err(_) => continue,
                        },
                        // Input exhausted: closing stdin tells the engine the
                        // turn sequence is over.
                        None => break,
                    },
                };
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let tool_gate = options.tool_gate.clone();
        let stream = try_stream! {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => Ok(None),
                    line = lines.next_line() => line,
                };
                let Some(line) = next? else { break };
                match classify_line(&line) {
                    EngineLine::Message(message) => yield *message,
                    EngineLine::Control(request) => {
                        if request.request.subtype != "can_use_tool" {
                            continue;
                        }
                        let tool_name = request.request.tool_name.as_deref().unwrap_or_default();
                        let decision = match &tool_gate {
                            Some(gate) => gate.can_use_tool(tool_name, &request.request.input).await,
                            None => ToolDecision::Allow { updated_input: None },
                        };
                        let _ = control_tx.send(control_response_line(&request.request_id, &decision));
                    }
                    EngineLine::Skip => {}
                }
            }

            if cancel.is_cancelled() {
                let _ = child.kill().await;
            } else {
                let status = child.wait().await?;
                if !status.success() {
                    Err(anyhow::anyhow!("agent engine exited with {status}"))?;
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
