use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "maxTokens")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Token/cost counters accumulated across a session's query generations.
///
/// `cost_baseline` absorbs the engine's own cost counter whenever it resets
/// (observed as a reported total lower than `last_sdk_cost`), so `total_cost`
/// stays monotonic across compactions and engine restarts.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionMetadata {
    #[serde(default, alias = "inputTokens")]
    pub input_tokens: u64,
    #[serde(default, alias = "outputTokens")]
    pub output_tokens: u64,
    #[serde(default, alias = "totalTokens")]
    pub total_tokens: u64,
    #[serde(default, alias = "toolCallCount")]
    pub tool_call_count: u64,
    #[serde(default, alias = "totalCost")]
    pub total_cost: f64,
    #[serde(default, alias = "lastSdkCost")]
    pub last_sdk_cost: f64,
    #[serde(default, alias = "costBaseline")]
    pub cost_baseline: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTime {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Default for SessionTime {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            created: now,
            updated: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub workspace: String,
    #[serde(default)]
    pub config: SessionConfig,
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default, alias = "sdkSessionId", skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub time: SessionTime,
}

impl Session {
    pub fn new(title: Option<String>, workspace: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            workspace: workspace.into(),
            config: SessionConfig::default(),
            metadata: SessionMetadata::default(),
            sdk_session_id: None,
            status: SessionStatus::Active,
            time: SessionTime::default(),
        }
    }

    pub fn touch(&mut self) {
        self.time.updated = Utc::now();
    }
}
