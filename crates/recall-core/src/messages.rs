use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SequenceId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of a conversation.
///
/// A message is settled once `streaming` and `is_error` are both false; until
/// then exactly one in-flight turn may rewrite it. Every rewrite bumps
/// `version` so observers can detect the change without comparing content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sequence_id: SequenceId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub version: u64,
}

// --- Convenience constructors ---

impl ChatMessage {
    pub fn new(
        sequence_id: SequenceId,
        role: Role,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence_id,
            role,
            content: content.into(),
            created_at,
            streaming: false,
            is_error: false,
            model: None,
            version: 0,
        }
    }

    /// A message built for a single request (system prompt, memory recap,
    /// instructions); never stored in a session.
    pub fn synthetic(role: Role, content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self::new(SequenceId::UNASSIGNED, role, content, created_at)
    }

    pub fn system(content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self::synthetic(Role::System, content, created_at)
    }

    pub fn user(content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self::synthetic(Role::User, content, created_at)
    }

    pub fn is_settled(&self) -> bool {
        !self.streaming && !self.is_error
    }

    /// Replace the content wholesale (streamed partials supersede each other).
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.touch();
    }

    pub fn append_content(&mut self, suffix: &str) {
        self.content.push_str(suffix);
        self.touch();
    }

    pub fn set_streaming(&mut self, streaming: bool) {
        if self.streaming != streaming {
            self.streaming = streaming;
            self.touch();
        }
    }

    pub fn mark_error(&mut self) {
        if !self.is_error {
            self.is_error = true;
            self.touch();
        }
    }

    fn touch(&mut self) {
        self.version += 1;
    }
}
