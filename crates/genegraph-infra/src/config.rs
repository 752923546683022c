//! Engine configuration loader.
//!
//! Reads a `genegraph.toml` file into [`EngineConfig`]. Falls back to the
//! defaults when the file is missing or malformed so the daemon always
//! starts.

use std::path::Path;

use genegraph_types::config::EngineConfig;

/// File name looked up in the data directory when no path is given.
pub const CONFIG_FILE_NAME: &str = "genegraph.toml";

/// Load engine configuration from `path`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: a warning is logged and the defaults are
///   returned.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}
