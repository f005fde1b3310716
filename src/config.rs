//! Supervisor configuration.
//!
//! An optional JSON file under the base directory. Absent keys fall back to
//! defaults, unknown keys are ignored, and a corrupt file is ignored with a
//! warning so a bad edit can never keep the supervisor down.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::pool::DEFAULT_MAX_CONCURRENT;
use crate::task::AgentKind;

/// Worker model used when the start request does not name one.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4-5";

/// Worker CLI binary resolved on PATH unless configured otherwise.
pub const DEFAULT_CLI_PATH: &str = "opencode";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Primary worker model, `provider/name`.
    pub model: String,
    pub fallback_model: Option<String>,
    pub defaults: Defaults,
    pub pool: PoolSettings,
    pub cli_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Defaults {
    pub agent: Option<AgentKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolSettings {
    pub max_concurrent: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            fallback_model: None,
            defaults: Defaults::default(),
            pool: PoolSettings::default(),
            cli_path: DEFAULT_CLI_PATH.to_string(),
        }
    }
}

impl ServerConfig {
    /// Load from `path`. A missing file yields the defaults; a corrupt file
    /// is reported once and also yields the defaults.
    pub fn load(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read config file, using defaults");
                return Self::default();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Config file is corrupt, using defaults");
                Self::default()
            }
        }
    }
}
