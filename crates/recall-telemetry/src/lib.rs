//! Tracing subscriber setup for processes embedding the recall engine.
//!
//! The engine crates only emit `tracing` events; the host process installs
//! the subscriber once at startup:
//!
//! ```no_run
//! use recall_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let settings = recall_settings::load_settings().expect("settings");
//! let config = TelemetryConfig::from_settings(&settings.logging).expect("log levels");
//! init_telemetry(&config).expect("subscriber");
//! ```

use std::str::FromStr;

use recall_settings::LoggingSettings;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by the RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "recall_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log level {value:?} for {scope}")]
    InvalidLevel { scope: String, value: String },
    #[error("failed to install subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

impl TelemetryConfig {
    pub fn from_settings(settings: &LoggingSettings) -> Result<Self, TelemetryError> {
        let log_level = parse_level("default", &settings.level)?;
        let module_levels = settings
            .modules
            .iter()
            .map(|(module, level)| Ok((module.clone(), parse_level(module, level)?)))
            .collect::<Result<Vec<_>, TelemetryError>>()?;
        Ok(Self {
            log_level,
            module_levels,
            json: settings.json,
        })
    }

    /// `EnvFilter` directives equivalent to this config.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

fn parse_level(scope: &str, value: &str) -> Result<Level, TelemetryError> {
    Level::from_str(value).map_err(|_| TelemetryError::InvalidLevel {
        scope: scope.to_string(),
        value: value.to_string(),
    })
}

/// Install the global subscriber. Call once at startup; a second call
/// returns [`TelemetryError::Init`].
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("recall_engine".into(), Level::DEBUG)],
            json: false,
        };
        assert_eq!(config.filter_directives(), "warn,recall_engine=debug");
    }

    #[test]
    fn from_settings_parses_levels() {
        let settings = LoggingSettings {
            level: "debug".into(),
            modules: vec![("recall_core".into(), "trace".into())],
            json: true,
        };
        let config = TelemetryConfig::from_settings(&settings).unwrap();
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.module_levels[0].1, Level::TRACE);
        assert!(config.json);
    }

    #[test]
    fn from_settings_rejects_unknown_level() {
        let settings = LoggingSettings {
            level: "loud".into(),
            ..Default::default()
        };
        assert!(matches!(
            TelemetryConfig::from_settings(&settings),
            Err(TelemetryError::InvalidLevel { .. })
        ));
    }

    #[test]
    fn second_init_fails() {
        let config = TelemetryConfig::default();
        let _ = init_telemetry(&config);
        assert!(init_telemetry(&config).is_err());
    }
}
