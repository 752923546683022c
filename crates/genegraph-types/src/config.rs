//! Engine configuration types.
//!
//! `EngineConfig` represents the `genegraph.toml` file that controls the
//! reconciliation cadence, retry policy defaults and logging.

use serde::{Deserialize, Serialize};

use crate::execution::JoinPolicy;

/// Top-level configuration for the engine.
///
/// All fields have defaults, so an empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Delay between two reconciliation passes of one execution.
    #[serde(default = "default_resync_interval_ms")]
    pub resync_interval_ms: u64,

    /// How many executions may be reconciled at the same time.
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,

    /// Attempts allowed for tasks that do not set `backoff_limit`.
    #[serde(default = "default_backoff_limit")]
    pub default_backoff_limit: u32,

    /// Join policy for dependent edges that do not declare one.
    #[serde(default)]
    pub default_join_policy: JoinPolicy,

    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Capacity of the engine event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// SQLite URL for persisted executions. Defaults to `genegraph.db` in the
    /// data directory.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Host directory holding one subdirectory per volume claim.
    #[serde(default)]
    pub volume_root: Option<String>,
}

fn default_resync_interval_ms() -> u64 {
    1_000
}

fn default_max_concurrent_executions() -> usize {
    16
}

fn default_backoff_limit() -> u32 {
    3
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resync_interval_ms: default_resync_interval_ms(),
            max_concurrent_executions: default_max_concurrent_executions(),
            default_backoff_limit: default_backoff_limit(),
            default_join_policy: JoinPolicy::default(),
            backoff: BackoffConfig::default(),
            event_bus_capacity: default_event_bus_capacity(),
            logging: LoggingConfig::default(),
            database_url: None,
            volume_root: None,
        }
    }
}

/// Exponential, bounded delay between retry attempts.
///
/// The n-th failure waits `min(initial_secs * multiplier^(n-1), max_secs)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_secs")]
    pub initial_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_secs")]
    pub max_secs: u64,
}

fn default_initial_secs() -> u64 {
    10
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_secs() -> u64 {
    360
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_secs: default_initial_secs(),
            multiplier: default_multiplier(),
            max_secs: default_max_secs(),
        }
    }
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive. `RUST_LOG` takes precedence when set.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Export spans through the OpenTelemetry stdout exporter.
    #[serde(default)]
    pub otel: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
            otel: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.resync_interval_ms, 1_000);
        assert_eq!(config.max_concurrent_executions, 16);
        assert_eq!(config.default_backoff_limit, 3);
        assert_eq!(config.default_join_policy, JoinPolicy::AllSucceeded);
        assert_eq!(config.backoff.initial_secs, 10);
        assert_eq!(config.backoff.max_secs, 360);
        assert_eq!(config.logging.filter, "info");
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.event_bus_capacity, 1024);
        assert!((config.backoff.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
resync_interval_ms = 250
default_backoff_limit = 5
default_join_policy = "run_regardless"
database_url = "sqlite:///var/lib/genegraph/state.db"
volume_root = "/var/lib/genegraph/volumes"

[backoff]
initial_secs = 1
max_secs = 30

[logging]
filter = "genegraph_core=debug"
json = true
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.resync_interval_ms, 250);
        assert_eq!(config.default_backoff_limit, 5);
        assert_eq!(config.default_join_policy, JoinPolicy::RunRegardless);
        assert_eq!(config.backoff.initial_secs, 1);
        assert!((config.backoff.multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.backoff.max_secs, 30);
        assert_eq!(config.logging.filter, "genegraph_core=debug");
        assert!(config.logging.json);
        assert_eq!(
            config.volume_root.as_deref(),
            Some("/var/lib/genegraph/volumes")
        );
    }

    #[test]
    fn test_unknown_join_policy_is_rejected() {
        let err = toml::from_str::<EngineConfig>(r#"default_join_policy = "any""#);
        assert!(err.is_err());
    }
}
