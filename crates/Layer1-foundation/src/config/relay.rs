//! Relay Config - runtime settings for the execution layer
//!
//! Load order: defaults, then the TOML file, then environment overrides.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Config file name under the platform config directory
pub const RELAY_CONFIG_FILE: &str = "config.toml";

/// Overrides the remote executor manager base URL
pub const ENV_EXECUTOR_URL: &str = "RELAY_EXECUTOR_URL";

/// Overrides the SQLite database path
pub const ENV_DATABASE: &str = "RELAY_DATABASE";

// ============================================================================
// Sections
// ============================================================================

/// Stale executor reaper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub enabled: bool,

    /// Seconds between sweeps
    pub interval_secs: u64,

    /// Base retention window in seconds
    pub retention_secs: u64,

    /// Per task-type retention windows (seconds), e.g. `code = 172800`
    pub task_type_retention: HashMap<String, u64>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        let mut task_type_retention = HashMap::new();
        task_type_retention.insert("code".to_string(), 48 * 3600);
        Self {
            enabled: true,
            interval_secs: 600,
            retention_secs: 24 * 3600,
            task_type_retention,
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Retention for a task type, falling back to the base window
    pub fn retention_for(&self, task_type: Option<&str>) -> Duration {
        task_type
            .and_then(|t| self.task_type_retention.get(t))
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| self.retention())
    }

    /// Shortest window across base and overrides; the store scan uses it
    pub fn min_retention(&self) -> Duration {
        let min_override = self.task_type_retention.values().copied().min();
        let secs = match min_override {
            Some(o) => o.min(self.retention_secs),
            None => self.retention_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Remote executor manager RPC settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub cancel_timeout_secs: u64,
    pub delete_timeout_secs: u64,
    pub dispatch_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8001".to_string(),
            cancel_timeout_secs: 5,
            delete_timeout_secs: 30,
            dispatch_timeout_secs: 10,
        }
    }
}

impl RemoteConfig {
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_secs)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_timeout_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}

/// Persistence bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Concurrent blocking store calls
    pub worker_threads: usize,

    /// Read-modify-write attempts before a conflict is surfaced
    pub max_write_retries: usize,

    /// Per-subtask live subscriber buffer
    pub subscriber_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            worker_threads: 8,
            max_write_retries: 5,
            subscriber_capacity: 256,
        }
    }
}

/// Pending interactive request registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractiveConfig {
    pub sweep_interval_secs: u64,
    pub default_timeout_secs: u64,

    /// How long resolved ids are remembered to reject a second resolve
    pub resolved_retention_secs: u64,
}

impl Default for InteractiveConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 5,
            default_timeout_secs: 300,
            resolved_retention_secs: 600,
        }
    }
}

impl InteractiveConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn resolved_retention(&self) -> Duration {
        Duration::from_secs(self.resolved_retention_secs)
    }
}

/// Local chat session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model round-trips per turn before the loop stops
    pub max_iterations: usize,
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            system_prompt: None,
        }
    }
}

// ============================================================================
// RelayConfig
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// SQLite database used by the CLI host
    pub database_path: Option<PathBuf>,

    pub reaper: ReaperConfig,
    pub remote: RemoteConfig,
    pub persistence: PersistenceConfig,
    pub interactive: InteractiveConfig,
    pub agent: AgentConfig,
}

impl RelayConfig {
    /// Load from an explicit path, or from the default location when present
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading relay config");
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// `<config_dir>/relay/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("relay").join(RELAY_CONFIG_FILE))
    }

    /// Resolved database path (`<data_dir>/relay/relay.db` by default)
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("relay")
                .join("relay.db")
        })
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_EXECUTOR_URL) {
            if !url.is_empty() {
                self.remote.base_url = url;
            }
        }
        if let Ok(db) = std::env::var(ENV_DATABASE) {
            if !db.is_empty() {
                self.database_path = Some(PathBuf::from(db));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.remote.cancel_timeout(), Duration::from_secs(5));
        assert_eq!(config.remote.delete_timeout(), Duration::from_secs(30));
        assert_eq!(config.reaper.retention(), Duration::from_secs(24 * 3600));
        assert_eq!(
            config.reaper.retention_for(Some("code")),
            Duration::from_secs(48 * 3600)
        );
        assert_eq!(config.reaper.retention_for(Some("chat")), config.reaper.retention());
        assert_eq!(config.reaper.retention_for(None), config.reaper.retention());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RelayConfig::from_toml(
            r#"
            database_path = "/tmp/relay.db"

            [reaper]
            retention_secs = 3600

            [reaper.task_type_retention]
            code = 7200
            sandbox = 600

            [remote]
            base_url = "http://executor-manager:8001"
            "#,
        )
        .unwrap();

        assert_eq!(config.database_path(), PathBuf::from("/tmp/relay.db"));
        assert_eq!(config.reaper.interval_secs, 600);
        assert_eq!(config.reaper.retention_secs, 3600);
        assert_eq!(config.reaper.min_retention(), Duration::from_secs(600));
        assert_eq!(config.remote.base_url, "http://executor-manager:8001");
        assert_eq!(config.remote.cancel_timeout_secs, 5);
        assert_eq!(config.persistence.max_write_retries, 5);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = RelayConfig::from_toml("reaper = 3").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
