//! Settings types.

use recall_core::ModelConfig;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallSettings {
    pub version: u32,
    /// Memory and topic policy.
    pub engine: EngineSettings,
    /// Model configuration given to newly created sessions.
    pub model: ModelConfig,
    pub logging: LoggingSettings,
}

impl Default for RecallSettings {
    fn default() -> Self {
        Self {
            version: 1,
            engine: EngineSettings::default(),
            model: ModelConfig::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl RecallSettings {
    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.topic_max_chars == 0 {
            return Err(SettingsError::InvalidValue(
                "engine.topic_max_chars must be positive".into(),
            ));
        }
        if self.engine.summary_fallback_max_tokens == 0 {
            return Err(SettingsError::InvalidValue(
                "engine.summary_fallback_max_tokens must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Policy constants for context assembly and memory compression.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Derive a topic label once the conversation is long enough.
    pub auto_topic: bool,
    /// Estimated tokens of history required before topic derivation runs.
    pub topic_min_tokens: u32,
    /// Upper bound on derived topic length, in characters.
    pub topic_max_chars: usize,
    /// Summary trim budget used when a session's `max_tokens` is not positive.
    pub summary_fallback_max_tokens: u32,
    /// System prompt template; the built-in template is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_template: Option<String>,
    /// Provider name exposed to templates as `{{provider}}`.
    pub provider_name: String,
    /// Knowledge cutoff exposed to templates as `{{cutoff}}`.
    pub knowledge_cutoff: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            auto_topic: true,
            topic_min_tokens: 50,
            topic_max_chars: 50,
            summary_fallback_max_tokens: 4000,
            system_template: None,
            provider_name: "OpenAI".into(),
            knowledge_cutoff: "2023-10".into(),
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` takes precedence.
    pub level: String,
    /// Per-module overrides, e.g. `[["recall_engine", "debug"]]`.
    pub modules: Vec<(String, String)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            modules: Vec::new(),
            json: false,
        }
    }
}
