//! Configuration for the ruleset cache service.
//!
//! Loaded from a TOML file; every field has a default, and a few settings
//! can be overridden from the environment:
//!
//! ```toml
//! [cache]
//! refresh_interval_secs = 30
//! read_timeout_secs = 10
//! coalesce_refreshes = true
//!
//! [store]
//! database_path = "./var/data/rules.db"
//!
//! [scheduler]
//! enabled = true
//! warm_interval_secs = 30
//! projects = ["chromium", "chromeos"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable overriding `store.database_path`.
pub const ENV_DB_PATH: &str = "RULESET_DB_PATH";
/// Environment variable overriding `cache.refresh_interval_secs`.
pub const ENV_REFRESH_INTERVAL_SECS: &str = "RULESET_REFRESH_INTERVAL_SECS";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
}

/// Ruleset cache behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which a cached ruleset is refreshed on next access
    pub refresh_interval_secs: u64,
    /// Timeout applied to store reads issued by the service (0 = none)
    pub read_timeout_secs: u64,
    /// Serialize refreshes of the same project so concurrent callers share one
    pub coalesce_refreshes: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 30,
            read_timeout_secs: 10,
            coalesce_refreshes: true,
        }
    }
}

impl CacheConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }
}

/// Rule store location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./var/data/rules.db"),
        }
    }
}

/// Configuration for the background warm-up scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether the scheduler is enabled
    pub enabled: bool,
    /// Interval between warm-up passes
    pub warm_interval_secs: u64,
    /// Projects kept warm
    pub projects: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warm_interval_secs: 30,
            projects: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn warm_interval(&self) -> Duration {
        Duration::from_secs(self.warm_interval_secs)
    }
}

impl Config {
    /// Parses a TOML document. Environment overrides are not applied.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Loads the file at `path` (or defaults when `None`) and applies
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies overrides from a key lookup (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DB_PATH) {
            self.store.database_path = PathBuf::from(path);
        }
        if let Some(value) = lookup(ENV_REFRESH_INTERVAL_SECS) {
            self.cache.refresh_interval_secs =
                value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: ENV_REFRESH_INTERVAL_SECS,
                    value,
                })?;
        }
        Ok(())
    }
}
