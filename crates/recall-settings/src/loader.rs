//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RecallSettings::default()`]
//! 2. If `~/.recall/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `RECALL_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::RecallSettings;

/// Resolve the path to the settings file (`~/.recall/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".recall").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RecallSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or out-of-range values are
/// errors.
pub fn load_settings_from_path(path: &Path) -> Result<RecallSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults deep-merged with the file at `path`, without env overrides.
pub fn read_settings_file(path: &Path) -> Result<RecallSettings> {
    let defaults = serde_json::to_value(RecallSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (fall back to file/default).
pub fn apply_env_overrides(settings: &mut RecallSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup (testable without touching the
/// process environment).
pub fn apply_overrides(settings: &mut RecallSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Model defaults ──────────────────────────────────────────────
    if let Some(v) = read("RECALL_DEFAULT_MODEL") {
        settings.model.model = v;
    }
    if let Some(v) = read("RECALL_SUMMARIZE_MODEL") {
        settings.model.summarize_model = Some(v);
    }
    if let Some(v) = parsed(&read, "RECALL_MAX_TOKENS", |v| parse_i64_range(v, 0, 10_000_000)) {
        settings.model.max_tokens = v;
    }
    if let Some(v) = parsed(&read, "RECALL_HISTORY_MESSAGE_COUNT", |v| {
        parse_usize_range(v, 0, 10_000)
    }) {
        settings.model.history_message_count = v;
    }
    if let Some(v) = parsed(&read, "RECALL_SEND_MEMORY", parse_bool) {
        settings.model.send_memory = v;
    }
    if let Some(v) = parsed(&read, "RECALL_COMPRESS_THRESHOLD", |v| {
        parse_u32_range(v, 0, 10_000_000)
    }) {
        settings.model.compress_message_length_threshold = v;
    }

    // ── Engine policy ───────────────────────────────────────────────
    if let Some(v) = parsed(&read, "RECALL_AUTO_TOPIC", parse_bool) {
        settings.engine.auto_topic = v;
    }
    if let Some(v) = parsed(&read, "RECALL_TOPIC_MIN_TOKENS", |v| {
        parse_u32_range(v, 0, 1_000_000)
    }) {
        settings.engine.topic_min_tokens = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read("RECALL_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = parsed(&read, "RECALL_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
}

fn parsed<T>(
    read: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let val = read(name)?;
    let result = parse(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_i64_range(val: &str, min: i64, max: i64) -> Option<i64> {
    let n: i64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
