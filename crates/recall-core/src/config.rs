use serde::{Deserialize, Serialize};

/// Per-session model configuration. Supplied by the caller and read-only to
/// the context and memory logic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f32,
    /// Token budget for the recent-message window. Zero or negative means no
    /// recent messages are sent.
    pub max_tokens: i64,
    /// How many of the most recent messages form the short-term memory.
    pub history_message_count: usize,
    /// Whether the rolling summary is sent and maintained.
    pub send_memory: bool,
    /// Estimated token length of unsummarized history above which the
    /// history is folded into the summary.
    pub compress_message_length_threshold: u32,
    /// Template applied to user input; `{{input}}` marks where the input goes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Model used for topic and summary requests. Falls back to `model`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarize_model: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            temperature: 0.5,
            max_tokens: 4000,
            history_message_count: 4,
            send_memory: true,
            compress_message_length_threshold: 1000,
            template: None,
            summarize_model: None,
        }
    }
}

impl ModelConfig {
    /// The window budget as an unsigned count; non-positive budgets are zero.
    pub fn token_budget(&self) -> u32 {
        u32::try_from(self.max_tokens.max(0)).unwrap_or(u32::MAX)
    }

    pub fn summarize_model(&self) -> &str {
        self.summarize_model.as_deref().unwrap_or(&self.model)
    }
}
