use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use tether_types::{EngineMessage, Session, SessionConfig};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Accepted while no engine invocation could take it; flushed into the
    /// queue when the next invocation starts.
    Pending,
    #[default]
    Sent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub status: MessageStatus,
    pub received_at: DateTime<Utc>,
    pub message: EngineMessage,
}

impl StoredMessage {
    pub fn new(session_id: &str, message: EngineMessage, status: MessageStatus) -> Self {
        Self {
            id: message.id().to_string(),
            session_id: session_id.to_string(),
            status,
            received_at: Utc::now(),
            message,
        }
    }
}

pub struct Storage {
    base: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
    messages: RwLock<HashMap<String, Vec<StoredMessage>>>,
}

impl Storage {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let sessions_file = base.join("sessions.json");
        let sessions = if sessions_file.exists() {
            let raw = fs::read_to_string(&sessions_file).await?;
            serde_json::from_str::<HashMap<String, Session>>(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        let messages_file = base.join("messages.json");
        let messages = if messages_file.exists() {
            let raw = fs::read_to_string(&messages_file).await?;
            serde_json::from_str::<HashMap<String, Vec<StoredMessage>>>(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            base,
            sessions: RwLock::new(sessions),
            messages: RwLock::new(messages),
        })
    }

    pub async fn create_session(
        &self,
        title: Option<String>,
        workspace: impl Into<String>,
        config: Option<SessionConfig>,
    ) -> anyhow::Result<Session> {
        let mut session = Session::new(title, workspace);
        if let Some(config) = config {
            session.config = config;
        }
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        self.flush().await?;
        Ok(session)
    }

    pub async fn save_session(&self, session: Session) -> anyhow::Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        self.flush().await
    }

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        let mut sessions = self
            .sessions
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| b.time.updated.cmp(&a.time.updated));
        sessions
    }

    /// Mutates one session under the write lock and persists the result.
    /// Returns the updated session, or None when the id is unknown.
    pub async fn update_session(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Session),
    ) -> anyhow::Result<Option<Session>> {
        let updated = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(id) else {
                return Ok(None);
            };
            mutate(session);
            session.touch();
            session.clone()
        };
        self.flush().await?;
        Ok(Some(updated))
    }

    /// Captures the engine-side session id the first time it is reported.
    /// Returns the updated session only when the id was newly set.
    pub async fn record_sdk_session(
        &self,
        session_id: &str,
        sdk_session_id: &str,
    ) -> anyhow::Result<Option<Session>> {
        let updated = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(session_id) else {
                return Ok(None);
            };
            if session.sdk_session_id.is_some() {
                return Ok(None);
            }
            session.sdk_session_id = Some(sdk_session_id.to_string());
            session.touch();
            session.clone()
        };
        self.flush().await?;
        Ok(Some(updated))
    }

    /// Appends one message to a session's transcript. Returns false without
    /// writing when a message with the same id already exists.
    pub async fn append_message(&self, stored: StoredMessage) -> anyhow::Result<bool> {
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(&stored.session_id)
                .context("session not found for append_message")?;
            let mut messages = self.messages.write().await;
            let transcript = messages.entry(stored.session_id.clone()).or_default();
            if transcript.iter().any(|existing| existing.id == stored.id) {
                return Ok(false);
            }
            transcript.push(stored);
            session.touch();
        }
        self.flush().await?;
        Ok(true)
    }

    pub async fn get_messages(&self, session_id: &str) -> Vec<StoredMessage> {
        self.messages
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_messages_by_status(
        &self,
        session_id: &str,
        status: MessageStatus,
    ) -> Vec<StoredMessage> {
        self.messages
            .read()
            .await
            .get(session_id)
            .map(|transcript| {
                transcript
                    .iter()
                    .filter(|stored| stored.status == status)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn update_message_status(
        &self,
        session_id: &str,
        message_id: &str,
        status: MessageStatus,
    ) -> anyhow::Result<bool> {
        let changed = {
            let mut messages = self.messages.write().await;
            let Some(transcript) = messages.get_mut(session_id) else {
                return Ok(false);
            };
            match transcript.iter_mut().find(|stored| stored.id == message_id) {
                Some(stored) => {
                    stored.status = status;
                    true
                }
                None => false,
            }
        };
        if changed {
            self.flush().await?;
        }
        Ok(changed)
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = self.sessions.read().await.clone();
        let payload = serde_json::to_string_pretty(&snapshot)?;
        fs::write(self.base.join("sessions.json"), payload).await?;
        let messages_snapshot = self.messages.read().await.clone();
        let messages_payload = serde_json::to_string_pretty(&messages_snapshot)?;
        fs::write(self.base.join("messages.json"), messages_payload).await?;
        Ok(())
    }
}
