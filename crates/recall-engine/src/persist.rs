//! Versioned snapshot of the whole store.
//!
//! Older snapshots are upgraded in place on the JSON value before typed
//! deserialization, filling the model config fields later versions added.

use recall_core::config::ModelConfig;
use recall_core::session::Session;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{EngineError, Result};
use crate::store::SessionStore;

pub const CURRENT_SCHEMA_VERSION: u32 = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub sessions: Vec<Session>,
}

impl PersistedState {
    pub fn capture(store: &SessionStore) -> Self {
        Self {
            version: CURRENT_SCHEMA_VERSION,
            sessions: store.sessions(),
        }
    }

    /// Load every session into `store`, replacing sessions with equal ids.
    /// Replies captured mid-stream are settled, since no turn will finish
    /// them.
    pub fn restore_into(self, store: &SessionStore) {
        for mut session in self.sessions {
            session.clamp_indices();
            for message in session.messages.iter_mut().filter(|m| m.streaming) {
                message.set_streaming(false);
            }
            store.insert(session);
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(json)?;
        Ok(serde_json::from_value(migrate(raw)?)?)
    }
}

/// Upgrade a snapshot of any known version to [`CURRENT_SCHEMA_VERSION`].
pub fn migrate(mut state: Value) -> Result<Value> {
    let version = state
        .get("version")
        .and_then(Value::as_u64)
        .map_or(1, |v| u32::try_from(v).unwrap_or(u32::MAX));
    if version > CURRENT_SCHEMA_VERSION {
        return Err(EngineError::UnsupportedVersion(version));
    }
    if version < CURRENT_SCHEMA_VERSION {
        info!(from = version, to = CURRENT_SCHEMA_VERSION, "migrating persisted state");
    }

    let defaults = ModelConfig::default();
    if let Some(sessions) = state.get_mut("sessions").and_then(Value::as_array_mut) {
        for session in sessions.iter_mut().filter_map(Value::as_object_mut) {
            if version < 3 {
                fill(session, "memory_summary", Value::from(""));
                fill(session, "last_summarize_index", Value::from(0));
            }
            let config = session
                .entry("model_config")
                .or_insert_with(|| Value::Object(Map::new()));
            let Some(config) = config.as_object_mut() else {
                continue;
            };
            fill(config, "model", Value::from(defaults.model.clone()));
            fill(config, "temperature", Value::from(defaults.temperature));
            fill(config, "max_tokens", Value::from(defaults.max_tokens));
            if version < 2 {
                fill(config, "send_memory", Value::from(defaults.send_memory));
                fill(
                    config,
                    "history_message_count",
                    Value::from(defaults.history_message_count),
                );
            }
            if version < 3 {
                fill(
                    config,
                    "compress_message_length_threshold",
                    Value::from(defaults.compress_message_length_threshold),
                );
            }
        }
    }

    if let Some(obj) = state.as_object_mut() {
        let _ = obj.insert("version".into(), Value::from(CURRENT_SCHEMA_VERSION));
    }
    Ok(state)
}

fn fill(obj: &mut Map<String, Value>, key: &str, value: Value) {
    let _ = obj.entry(key).or_insert(value);
}
