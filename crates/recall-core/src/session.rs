use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::ids::{SequenceId, SessionId};
use crate::messages::{ChatMessage, Role};

/// Topic every session starts with. Topic derivation only runs while the
/// session still carries it.
pub const DEFAULT_TOPIC: &str = "New Conversation";

/// Running totals over finished assistant replies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStat {
    pub char_count: u64,
    pub word_count: u64,
    pub token_count: u64,
    pub turn_count: u64,
}

impl SessionStat {
    /// Account for one finished assistant reply.
    pub fn record_reply(&mut self, content: &str, tokens: u32) {
        self.char_count += content.chars().count() as u64;
        self.word_count += content.split_whitespace().count() as u64;
        self.token_count += u64::from(tokens);
        self.turn_count += 1;
    }
}

/// One conversation: its messages, rolling summary and metadata.
///
/// Invariants (restored by [`Session::clamp_indices`] after every change):
/// `last_summarize_index <= messages.len()` and
/// `clear_context_index <= messages.len()`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub topic: String,
    pub messages: Vec<ChatMessage>,
    /// Rolling summary of `messages[..last_summarize_index]`.
    pub memory_summary: String,
    pub last_summarize_index: usize,
    /// Messages below this index are kept for display but never resent.
    #[serde(default)]
    pub clear_context_index: usize,
    pub model_config: ModelConfig,
    /// Preset prompts sent verbatim in place of the synthesized system prompt.
    #[serde(default)]
    pub context_prompts: Vec<ChatMessage>,
    #[serde(default)]
    pub stat: SessionStat,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// Bumped on every mutation through the store.
    #[serde(default)]
    pub revision: u64,
    #[serde(default = "first_sequence")]
    pub next_sequence: SequenceId,
    /// Bumped whenever stored history is discarded (reset or truncation).
    /// Background work planned against an older epoch must not write back.
    #[serde(default)]
    pub history_epoch: u64,
}

fn first_sequence() -> SequenceId {
    SequenceId::new(1)
}

impl Session {
    pub fn new(id: SessionId, model_config: ModelConfig, now: DateTime<Utc>) -> Self {
        Self {
            id,
            topic: DEFAULT_TOPIC.to_string(),
            messages: Vec::new(),
            memory_summary: String::new(),
            last_summarize_index: 0,
            clear_context_index: 0,
            model_config,
            context_prompts: Vec::new(),
            stat: SessionStat::default(),
            created_at: now,
            last_update: now,
            revision: 0,
            next_sequence: first_sequence(),
            history_epoch: 0,
        }
    }

    pub fn has_default_topic(&self) -> bool {
        self.topic == DEFAULT_TOPIC
    }

    /// Reserve the next sequence id. Ids are never reused, even after
    /// messages are deleted.
    pub fn allocate_sequence(&mut self) -> SequenceId {
        if self.next_sequence == SequenceId::UNASSIGNED {
            self.next_sequence = first_sequence();
        }
        let id = self.next_sequence;
        self.next_sequence = id.next();
        id
    }

    /// Append a settled message and return its sequence id.
    pub fn push_message(
        &mut self,
        role: Role,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> SequenceId {
        let id = self.allocate_sequence();
        self.messages.push(ChatMessage::new(id, role, content, now));
        id
    }

    /// Append an empty assistant message that a turn will stream into.
    pub fn push_pending_reply(&mut self, model: &str, now: DateTime<Utc>) -> SequenceId {
        let id = self.allocate_sequence();
        let mut reply = ChatMessage::new(id, Role::Assistant, "", now);
        reply.streaming = true;
        reply.model = Some(model.to_string());
        self.messages.push(reply);
        id
    }

    pub fn message_index(&self, sequence_id: SequenceId) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.sequence_id == sequence_id)
    }

    pub fn message(&self, sequence_id: SequenceId) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.sequence_id == sequence_id)
    }

    pub fn message_mut(&mut self, sequence_id: SequenceId) -> Option<&mut ChatMessage> {
        self.messages
            .iter_mut()
            .find(|m| m.sequence_id == sequence_id)
    }

    /// Record a mutation: bump the revision and the update timestamp.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.revision += 1;
        self.last_update = now;
    }

    /// Drop all messages and memory. Topic and statistics are kept.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.memory_summary.clear();
        self.last_summarize_index = 0;
        self.clear_context_index = 0;
        self.history_epoch += 1;
    }

    /// Exclude everything so far from future context windows. Calling it
    /// again with no new messages in between undoes the marker.
    pub fn toggle_clear_context(&mut self) {
        if self.clear_context_index == self.messages.len() && self.clear_context_index > 0 {
            self.clear_context_index = 0;
        } else {
            self.clear_context_index = self.messages.len();
        }
    }

    /// Remove one message. Indices pointing past it shift down so they keep
    /// marking the same messages.
    pub fn delete_message(&mut self, sequence_id: SequenceId) -> bool {
        let Some(index) = self.message_index(sequence_id) else {
            return false;
        };
        self.messages.remove(index);
        if index < self.last_summarize_index {
            self.last_summarize_index -= 1;
        }
        if index < self.clear_context_index {
            self.clear_context_index -= 1;
        }
        true
    }

    /// Truncate the conversation to `messages[..index]`.
    pub fn truncate_from(&mut self, index: usize) {
        if index < self.messages.len() {
            self.messages.truncate(index);
            self.history_epoch += 1;
        }
        self.clamp_indices();
    }

    pub fn clamp_indices(&mut self) {
        let len = self.messages.len();
        self.last_summarize_index = self.last_summarize_index.min(len);
        self.clear_context_index = self.clear_context_index.min(len);
    }

    pub fn indices_valid(&self) -> bool {
        let len = self.messages.len();
        self.last_summarize_index <= len && self.clear_context_index <= len
    }
}
