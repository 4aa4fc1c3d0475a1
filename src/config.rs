use crate::harness::terminal::{default_candidates, TerminalCandidate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR_NAME: &str = "tys-asm";
const HISTORY_FILE_NAME: &str = "eta_history.json";
const CONFIG_FILE_NAME: &str = "engine.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub history_path: PathBuf,
    pub log_dir: PathBuf,
    pub elevation_agent: String,
    pub terminal_candidates: Vec<TerminalCandidate>,
    pub indeterminate_grace_ms: u64,
    pub max_diagnostic_chars: usize,
    pub output_drain_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_path: config_dir().join(HISTORY_FILE_NAME),
            log_dir: cache_dir().join("logs"),
            elevation_agent: "pkexec".to_string(),
            terminal_candidates: default_candidates(),
            indeterminate_grace_ms: 3_000,
            max_diagnostic_chars: 2_000,
            output_drain_ms: 2_000,
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config document. Missing or unreadable files fall back to
    /// defaults; a broken document is logged and ignored.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) => {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %error, "engine config unreadable; using defaults");
                }
                return Self::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "engine config is corrupt; using defaults");
                Self::default()
            }
        }
    }

    pub fn load_default() -> Self {
        Self::load(&config_dir().join(CONFIG_FILE_NAME))
    }

    pub fn indeterminate_grace(&self) -> Duration {
        Duration::from_millis(self.indeterminate_grace_ms)
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".cache")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}
