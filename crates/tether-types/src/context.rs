use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextCategory {
    pub name: String,
    pub tokens: u64,
}

/// Context-window usage snapshot, either coarse (usage totals) or detailed
/// (parsed from an engine context report).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ContextBreakdown {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub used_tokens: u64,
    #[serde(default)]
    pub max_tokens: u64,
    #[serde(default)]
    pub percentage_used: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<ContextCategory>,
}

impl ContextBreakdown {
    pub fn recompute_percentage(&mut self) {
        self.percentage_used = if self.max_tokens == 0 {
            0.0
        } else {
            (self.used_tokens as f64 / self.max_tokens as f64) * 100.0
        };
    }
}
