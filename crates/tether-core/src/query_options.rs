use std::sync::Arc;

use tether_agent::{InvokeOptions, ToolGate};
use tether_types::Session;

use crate::config::SessionDefaults;

/// Assembles engine invocation options from configured defaults, per-session
/// overrides and the tool-permission callback.
pub struct QueryOptionsBuilder {
    options: InvokeOptions,
}

impl QueryOptionsBuilder {
    pub fn new(defaults: &SessionDefaults) -> Self {
        let options = InvokeOptions {
            model: defaults.model.clone(),
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
            ..Default::default()
        };
        Self { options }
    }

    /// Session overrides win over configured defaults; a previously captured
    /// engine session id turns the invocation into a resume.
    pub fn add_session_state_options(mut self, session: &Session) -> Self {
        if let Some(model) = &session.config.model {
            self.options.model = Some(model.clone());
        }
        if let Some(max_tokens) = session.config.max_tokens {
            self.options.max_tokens = Some(max_tokens);
        }
        if let Some(temperature) = session.config.temperature {
            self.options.temperature = Some(f64::from(temperature));
        }
        if let Some(sdk_session_id) = &session.sdk_session_id {
            self.options.resume_session_id = Some(sdk_session_id.clone());
        }
        if !session.workspace.is_empty() {
            self.options.workspace = Some(session.workspace.clone());
        }
        self
    }

    pub fn set_can_use_tool(mut self, gate: Arc<dyn ToolGate>) -> Self {
        self.options.tool_gate = Some(gate);
        self
    }

    pub fn build(self) -> InvokeOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_overrides_beat_defaults() {
        let defaults = SessionDefaults {
            model: Some("default-model".to_string()),
            max_tokens: Some(1_000),
            temperature: Some(0.5),
        };
        let mut session = Session::new(None, "/work/demo");
        session.config.model = Some("session-model".to_string());
        session.sdk_session_id = Some("sdk_42".to_string());

        let options = QueryOptionsBuilder::new(&defaults)
            .add_session_state_options(&session)
            .build();

        assert_eq!(options.model.as_deref(), Some("session-model"));
        assert_eq!(options.max_tokens, Some(1_000));
        assert_eq!(options.resume_session_id.as_deref(), Some("sdk_42"));
        assert_eq!(options.workspace.as_deref(), Some("/work/demo"));
        assert!(options.tool_gate.is_none());
    }

    #[test]
    fn fresh_session_has_no_resume_id() {
        let defaults = SessionDefaults::default();
        let session = Session::new(None, ".");
        let options = QueryOptionsBuilder::new(&defaults)
            .add_session_state_options(&session)
            .build();
        assert!(options.resume_session_id.is_none());
        assert!(options.model.is_none());
    }
}
