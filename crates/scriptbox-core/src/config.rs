//! Engine configuration: TOML file, then `SCRIPTBOX_*` environment overrides.
//!
//! ```toml
//! [pool]
//! max_size = 8
//! acquire_timeout_ms = 5000
//!
//! [execution]
//! max_timeout_secs = 300
//!
//! [storage]
//! kind = "local"
//! data_dir = ".scriptbox"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use scriptbox_state::{HistoryRetention, StorageBackend};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ContextLimits;
use crate::pool::PoolConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Ceiling applied on top of every policy's own limit.
    pub max_timeout_secs: u64,
    /// How long a cancelled evaluation gets to unwind before it is abandoned.
    pub grace_period_ms: u64,
    pub max_script_bytes: usize,
    pub allow_custom_policies: bool,
    pub worker_stack_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        let limits = ContextLimits::default();
        Self {
            max_timeout_secs: limits.max_timeout_secs,
            grace_period_ms: 1000,
            max_script_bytes: limits.max_script_bytes,
            allow_custom_policies: limits.allow_custom_policies,
            worker_stack_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ExecutionConfig {
    pub fn limits(&self) -> ContextLimits {
        ContextLimits {
            max_script_bytes: self.max_script_bytes,
            max_timeout_secs: self.max_timeout_secs,
            allow_custom_policies: self.allow_custom_policies,
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_entries: Option<usize>,
    pub max_age_secs: Option<u64>,
    /// Characters of script text kept in each history entry.
    pub script_preview_chars: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        let retention = HistoryRetention::default();
        Self {
            max_entries: retention.max_entries,
            max_age_secs: retention.max_age_secs,
            script_preview_chars: 4096,
        }
    }
}

impl HistoryConfig {
    pub fn retention(&self) -> HistoryRetention {
        HistoryRetention {
            max_entries: self.max_entries,
            max_age_secs: self.max_age_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions untouched for longer are removed by maintenance.
    pub max_idle_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_idle_secs: 7 * 24 * 3600,
        }
    }
}

impl SessionConfig {
    pub fn max_idle(&self) -> ConfigResult<chrono::TimeDelta> {
        i64::try_from(self.max_idle_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .ok_or_else(|| invalid("sessions.max_idle_secs", "out of range"))
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub execution: ExecutionConfig,
    pub history: HistoryConfig,
    pub sessions: SessionConfig,
    pub storage: StorageBackend,
}

impl EngineConfig {
    /// Defaults with everything in memory; for tests and one-shot runs.
    pub fn ephemeral() -> Self {
        Self {
            storage: StorageBackend::Memory,
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Apply `SCRIPTBOX_*` overrides from the process environment.
    pub fn apply_env(self) -> ConfigResult<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`.
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        if let Some(raw) = lookup("SCRIPTBOX_POOL_MAX_SIZE") {
            self.pool.max_size = parse_number("SCRIPTBOX_POOL_MAX_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("SCRIPTBOX_ACQUIRE_TIMEOUT_MS") {
            self.pool.acquire_timeout_ms = parse_number("SCRIPTBOX_ACQUIRE_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("SCRIPTBOX_MAX_TIMEOUT_SECS") {
            self.execution.max_timeout_secs = parse_number("SCRIPTBOX_MAX_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("SCRIPTBOX_HISTORY_MAX_ENTRIES") {
            self.history.max_entries = Some(parse_number("SCRIPTBOX_HISTORY_MAX_ENTRIES", &raw)?);
        }

        let data_dir = lookup("SCRIPTBOX_DATA_DIR").map(PathBuf::from);
        let surreal_url = lookup("SCRIPTBOX_SURREALDB_URL");
        if let Some(kind) = lookup("SCRIPTBOX_STORAGE") {
            self.storage = match kind.trim().to_ascii_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                "local" => StorageBackend::Local {
                    data_dir: data_dir.clone().unwrap_or_else(|| PathBuf::from(".scriptbox")),
                },
                "surreal" => StorageBackend::Surreal {
                    url: surreal_url
                        .clone()
                        .ok_or_else(|| invalid("SCRIPTBOX_SURREALDB_URL", "required for surreal storage"))?,
                },
                "cloud" => StorageBackend::Cloud,
                other => {
                    return Err(invalid(
                        "SCRIPTBOX_STORAGE",
                        format!("unknown backend {other:?} (expected memory, local, surreal or cloud)"),
                    ))
                }
            };
        } else {
            match &mut self.storage {
                StorageBackend::Local { data_dir: dir } => {
                    if let Some(d) = data_dir {
                        *dir = d;
                    }
                }
                StorageBackend::Surreal { url } => {
                    if let Some(u) = surreal_url {
                        *url = u;
                    }
                }
                StorageBackend::Memory | StorageBackend::Cloud => {}
            }
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.pool.max_size == 0 {
            return Err(invalid("pool.max_size", "must be at least 1"));
        }
        if self.pool.min_idle > self.pool.max_size {
            return Err(invalid(
                "pool.min_idle",
                format!("{} exceeds max_size {}", self.pool.min_idle, self.pool.max_size),
            ));
        }
        if self.pool.acquire_timeout_ms == 0 {
            return Err(invalid("pool.acquire_timeout_ms", "must be positive"));
        }
        if self.execution.max_timeout_secs == 0 {
            return Err(invalid("execution.max_timeout_secs", "must be positive"));
        }
        if self.execution.max_script_bytes == 0 {
            return Err(invalid("execution.max_script_bytes", "must be positive"));
        }
        self.sessions.max_idle()?;
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> ConfigResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(key, format!("{raw:?} is not a valid number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.execution.max_timeout_secs, 300);
        assert!(!config.execution.allow_custom_policies);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [pool]
            max_size = 3

            [storage]
            kind = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.max_size, 3);
        assert_eq!(config.pool.acquire_timeout_ms, 5000);
        assert_eq!(config.storage, StorageBackend::Memory);
    }

    #[test]
    fn test_rejects_min_idle_above_max() {
        let err = EngineConfig::from_toml_str("[pool]\nmax_size = 2\nmin_idle = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "pool.min_idle"));
    }

    #[test]
    fn test_rejects_unrepresentable_idle_window() {
        let mut config = EngineConfig::default();
        config.sessions.max_idle_secs = u64::MAX;
        match config.validate() {
            Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, "sessions.max_idle_secs"),
            other => panic!("expected invalid key, got {other:?}"),
        }
        config.sessions.max_idle_secs = 3600;
        assert_eq!(config.sessions.max_idle().unwrap(), chrono::TimeDelta::hours(1));
    }

    #[test]
    fn test_rejects_zero_pool() {
        assert!(EngineConfig::from_toml_str("[pool]\nmax_size = 0\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::default()
            .apply_env_from(env(&[
                ("SCRIPTBOX_POOL_MAX_SIZE", "5"),
                ("SCRIPTBOX_MAX_TIMEOUT_SECS", "60"),
                ("SCRIPTBOX_STORAGE", "surreal"),
                ("SCRIPTBOX_SURREALDB_URL", "mem://"),
            ]))
            .unwrap();
        assert_eq!(config.pool.max_size, 5);
        assert_eq!(config.execution.max_timeout_secs, 60);
        assert_eq!(
            config.storage,
            StorageBackend::Surreal {
                url: "mem://".into()
            }
        );
    }

    #[test]
    fn test_env_data_dir_applies_to_local_backend() {
        let config = EngineConfig::default()
            .apply_env_from(env(&[("SCRIPTBOX_DATA_DIR", "/var/lib/scriptbox")]))
            .unwrap();
        assert_eq!(
            config.storage,
            StorageBackend::Local {
                data_dir: PathBuf::from("/var/lib/scriptbox")
            }
        );
    }

    #[test]
    fn test_env_rejects_garbage() {
        let err = EngineConfig::default()
            .apply_env_from(env(&[("SCRIPTBOX_POOL_MAX_SIZE", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("SCRIPTBOX_POOL_MAX_SIZE"));

        let err = EngineConfig::default()
            .apply_env_from(env(&[("SCRIPTBOX_STORAGE", "s3")]))
            .unwrap_err();
        assert!(err.to_string().contains("unknown backend"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scriptbox.toml");
        std::fs::write(&path, "[history]\nmax_entries = 50\n").unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.history.max_entries, Some(50));

        let missing = EngineConfig::from_file(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
