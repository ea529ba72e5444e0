use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One buffered user turn awaiting dispatch to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueItem {
    pub id: String,
    pub text: String,
    #[serde(default, alias = "isCommand")]
    pub is_command: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemSubtype {
    Init,
    Status,
    CompactBoundary,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    #[default]
    Success,
    Error,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(alias = "toolUseId")]
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default, alias = "isError")]
        is_error: bool,
    },
}

/// Assistant/user message bodies arrive either as a bare string or as a
/// block list, depending on the engine's emitter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated visible text, ignoring thinking and tool blocks.
    pub fn plain_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks.as_slice(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemMessage {
    #[serde(default = "new_message_id")]
    pub id: String,
    pub subtype: SystemSubtype,
    #[serde(default, alias = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, alias = "compactMetadata", skip_serializing_if = "Option::is_none")]
    pub compact_metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantMessage {
    #[serde(default = "new_message_id")]
    pub id: String,
    #[serde(default, alias = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(
        default,
        alias = "parentToolUseId",
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_tool_use_id: Option<String>,
    pub message: MessageBody,
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
    #[serde(default, alias = "isSynthetic", skip_serializing_if = "is_false")]
    pub synthetic: bool,
}

impl AssistantMessage {
    /// Builds a synthetic single-text-block assistant message, used to render
    /// failures as ordinary chat content.
    pub fn from_text(session_id: &str, text: impl Into<String>, error: bool) -> Self {
        Self {
            id: new_message_id(),
            session_id: Some(session_id.to_string()),
            parent_tool_use_id: None,
            message: MessageBody {
                role: Some("assistant".to_string()),
                model: None,
                content: MessageContent::Blocks(vec![ContentBlock::Text { text: text.into() }]),
            },
            error,
            synthetic: true,
        }
    }

    pub fn tool_use_count(&self) -> usize {
        self.message
            .content
            .blocks()
            .iter()
            .filter(|block| matches!(block, ContentBlock::ToolUse { .. }))
            .count()
    }

    /// True when the message carries nothing but thinking blocks.
    pub fn is_thinking_only(&self) -> bool {
        let blocks = self.message.content.blocks();
        !blocks.is_empty()
            && blocks
                .iter()
                .all(|block| matches!(block, ContentBlock::Thinking { .. }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserMessage {
    #[serde(default = "new_message_id")]
    pub id: String,
    #[serde(default, alias = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(
        default,
        alias = "parentToolUseId",
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_tool_use_id: Option<String>,
    pub message: MessageBody,
    #[serde(default, alias = "isSynthetic", skip_serializing_if = "is_false")]
    pub synthetic: bool,
    #[serde(default, alias = "isReplay", skip_serializing_if = "is_false")]
    pub replay: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UsageStats {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl UsageStats {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultMessage {
    #[serde(default = "new_message_id")]
    pub id: String,
    #[serde(default, alias = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub subtype: ResultSubtype,
    #[serde(default, alias = "durationMs", skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, alias = "numTurns", skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(
        default,
        alias = "totalCostUsd",
        skip_serializing_if = "Option::is_none"
    )]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
    #[serde(default, alias = "isError", skip_serializing_if = "is_false")]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// One message emitted by the external agent engine, discriminated by `type`
/// (and further by the `subtype` field for system/result payloads).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EngineMessage {
    System(SystemMessage),
    Assistant(AssistantMessage),
    User(UserMessage),
    Result(ResultMessage),
}

impl EngineMessage {
    pub fn id(&self) -> &str {
        match self {
            EngineMessage::System(msg) => &msg.id,
            EngineMessage::Assistant(msg) => &msg.id,
            EngineMessage::User(msg) => &msg.id,
            EngineMessage::Result(msg) => &msg.id,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            EngineMessage::System(msg) => msg.session_id.as_deref(),
            EngineMessage::Assistant(msg) => msg.session_id.as_deref(),
            EngineMessage::User(msg) => msg.session_id.as_deref(),
            EngineMessage::Result(msg) => msg.session_id.as_deref(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            EngineMessage::System(_) => "system",
            EngineMessage::Assistant(_) => "assistant",
            EngineMessage::User(_) => "user",
            EngineMessage::Result(_) => "result",
        }
    }

    pub fn subtype_name(&self) -> Option<&'static str> {
        match self {
            EngineMessage::System(msg) => Some(match msg.subtype {
                SystemSubtype::Init => "init",
                SystemSubtype::Status => "status",
                SystemSubtype::CompactBoundary => "compact_boundary",
                SystemSubtype::Other => "other",
            }),
            EngineMessage::Result(msg) => Some(match msg.subtype {
                ResultSubtype::Success => "success",
                ResultSubtype::Error => "error",
                ResultSubtype::Other => "other",
            }),
            _ => None,
        }
    }
}
