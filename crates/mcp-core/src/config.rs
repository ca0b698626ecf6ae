//! Configuration for the whole engine.
//!
//! Loaded from TOML with precedence:
//! 1. `MCP_CONFIG` env var naming a file
//! 2. `<data_dir>/config.toml`
//! 3. Default values
//!
//! Every field has a default, so a partial file is fine.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::action_log::ActionLogConfig;
use crate::cache::CacheConfig;
use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::session::SessionConfig;
use crate::sync::SyncConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub action_log: ActionLogConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Which storage backend to build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
    },
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<ConfigValidationError> for Error {
    fn from(e: ConfigValidationError) -> Self {
        Error::Config(e.to_string())
    }
}

fn invalid(field: &str, message: &str) -> ConfigValidationError {
    ConfigValidationError::InvalidValue {
        field: field.into(),
        message: message.into(),
    }
}

/// Data directory for config and the default database.
pub fn default_data_dir() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("dev", "mcp", "mcp") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mcp")
    }
}

impl McpConfig {
    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from a specific file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content).map_err(|e| {
                Error::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save as TOML, creating the parent directory.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("MCP_CONFIG") {
            PathBuf::from(path)
        } else {
            default_data_dir().join("config.toml")
        }
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_sessions(mut self, sessions: SessionConfig) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_action_log(mut self, action_log: ActionLogConfig) -> Self {
        self.action_log = action_log;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.engine = self.engine.with_timeout(timeout);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), ConfigValidationError> {
        if self.engine.timeout_ms == 0 {
            return Err(invalid("engine.timeout_ms", "must be greater than 0"));
        }
        if self.cache.max_size == 0 {
            return Err(invalid("cache.max_size", "must be greater than 0"));
        }
        if self.cache.cleanup_interval_secs == 0 {
            return Err(invalid("cache.cleanup_interval_secs", "must be greater than 0"));
        }
        if self.sessions.default_expiration_minutes == 0 {
            return Err(invalid(
                "sessions.default_expiration_minutes",
                "must be greater than 0",
            ));
        }
        if self.sessions.max_concurrent_sessions == 0 {
            return Err(invalid(
                "sessions.max_concurrent_sessions",
                "must be greater than 0",
            ));
        }
        if self.sessions.cleanup_interval_secs == 0 {
            return Err(invalid("sessions.cleanup_interval_secs", "must be greater than 0"));
        }
        if self.action_log.buffer_size == 0 {
            return Err(invalid("action_log.buffer_size", "must be greater than 0"));
        }
        if self.action_log.flush_interval_secs == 0 {
            return Err(invalid("action_log.flush_interval_secs", "must be greater than 0"));
        }
        if self.sync.max_retries == 0 {
            return Err(invalid("sync.max_retries", "must be at least 1"));
        }
        if self.sync.batch_size == 0 {
            return Err(invalid("sync.batch_size", "must be greater than 0"));
        }
        if self.sync.sync_interval_secs == 0 {
            return Err(invalid("sync.sync_interval_secs", "must be greater than 0"));
        }
        if let StorageConfig::Sqlite { path } = &self.storage {
            if path.as_os_str().is_empty() {
                return Err(invalid("storage.path", "must not be empty"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = McpConfig::default();
        assert_eq!(config.engine.timeout_ms, 30_000);
        assert!(config.engine.enforce_permissions);
        assert_eq!(config.cache.max_size, 1000);
        assert_eq!(config.cache.default_ttl_secs, None);
        assert_eq!(config.sessions.default_expiration_minutes, 60);
        assert_eq!(config.sessions.max_concurrent_sessions, 5);
        assert_eq!(config.sessions.retention_hours, 24);
        assert_eq!(config.action_log.buffer_size, 100);
        assert_eq!(config.action_log.retention_days, 30);
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.retry_delay_ms, 1000);
        assert_eq!(config.sync.batch_size, 10);
        assert_eq!(config.storage, StorageConfig::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: McpConfig = toml::from_str(
            r#"
            [engine]
            timeout_ms = 500

            [sessions]
            max_concurrent_sessions = 2

            [storage]
            backend = "sqlite"
            path = "/tmp/mcp.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.timeout_ms, 500);
        assert!(config.engine.enable_logging);
        assert_eq!(config.sessions.max_concurrent_sessions, 2);
        assert_eq!(config.sessions.default_expiration_minutes, 60);
        assert_eq!(
            config.storage,
            StorageConfig::Sqlite {
                path: PathBuf::from("/tmp/mcp.db")
            }
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = McpConfig::default()
            .with_timeout(Duration::from_secs(5))
            .with_cache(CacheConfig::default().with_max_size(10));
        config.save_to(&path).unwrap();

        let loaded = McpConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let loaded = McpConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, McpConfig::default());
    }

    #[test]
    fn test_validation() {
        let config = McpConfig::default().with_cache(CacheConfig::default().with_max_size(0));
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value for cache.max_size: must be greater than 0"
        );

        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync]\nbatch_size = 0\n").unwrap();
        assert!(matches!(McpConfig::load_from(&path), Err(Error::Config(_))));
    }
}
