//! File configuration for the command-line tool.
//!
//! Every key is optional; missing keys take the library defaults.
//!
//! ```json
//! {
//!   "store": { "lock_wait_timeout_ms": 5000, "default_isolation": "READ_COMMITTED" },
//!   "pool": { "max_connections": 10, "acquire_timeout_ms": 5000 },
//!   "retry": {
//!     "max_attempts": 3,
//!     "initial_delay_ms": 100,
//!     "backoff_multiplier": 2.0,
//!     "max_delay_ms": 5000
//!   },
//!   "outcome_log": "decisions.jsonl"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{PoolConfig, StoreConfig, StoreId};
use crate::transaction::{IsolationLevel, PolicyError, RetryPolicy};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid retry settings: {0}")]
    Retry(#[from] PolicyError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub lock_wait_timeout_ms: u64,
    pub default_isolation: IsolationLevel,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            lock_wait_timeout_ms: 5000,
            default_isolation: IsolationLevel::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts(),
            initial_delay_ms: millis(policy.initial_delay()),
            backoff_multiplier: policy.backoff_multiplier(),
            max_delay_ms: millis(policy.max_delay()),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreSection,
    pub pool: PoolSection,
    pub retry: RetrySection,
    /// File-backed outcome log for distributed transactions. In memory when
    /// absent.
    pub outcome_log: Option<PathBuf>,
}

impl Config {
    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn store_config(&self, store_id: StoreId) -> StoreConfig {
        StoreConfig::new(store_id)
            .lock_wait_timeout(Duration::from_millis(self.store.lock_wait_timeout_ms))
            .default_isolation(self.store.default_isolation)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .max_connections(self.pool.max_connections)
            .acquire_timeout(Duration::from_millis(self.pool.acquire_timeout_ms))
    }

    /// The validated retry policy.
    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let retry = &self.retry;
        Ok(RetryPolicy::new(
            retry.max_attempts,
            Duration::from_millis(retry.initial_delay_ms),
            retry.backoff_multiplier,
            Duration::from_millis(retry.max_delay_ms),
        )?)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
