//! Engine configuration
//!
//! ```toml
//! [storage]
//! root = "/var/lib/durable-flow"
//!
//! [storage.retry]
//! max_attempts = 3
//! initial_interval_ms = 50
//!
//! [execution]
//! max_workers = 8
//! resume_timeout_ms = 30000
//! default_durability = "fully_durable"
//!
//! [logging]
//! level = "info"
//! ```
//!
//! [`ConfigLoader`] starts from the defaults, merges each TOML file it was
//! given in order (a later file overrides only the keys it sets), and finally
//! applies the `DURABLE_FLOW_ROOT` environment variable.

use crate::durability::DurabilityLevel;
use crate::error::{FlowError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable overriding `storage.root`
pub const ROOT_ENV_VAR: &str = "DURABLE_FLOW_ROOT";

/// Directory under the storage root that holds one directory per run
pub const RUNS_DIR: &str = "runs";

/// Main engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for all runs
    pub root: PathBuf,

    /// Retries for failed node writes
    pub retry: RetryConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".durable-flow"),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_interval_ms: u64,
    pub backoff_factor: f64,
    pub max_interval_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 50,
            backoff_factor: 2.0,
            max_interval_ms: 2000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .with_initial_interval(self.initial_interval_ms as f64 / 1000.0)
            .with_backoff_factor(self.backoff_factor)
            .with_max_interval(self.max_interval_ms as f64 / 1000.0)
            .with_jitter(self.jitter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Runs driven concurrently
    pub max_workers: usize,

    /// Bound on the resume of a single run
    pub resume_timeout_ms: u64,

    /// Level for definitions that do not choose one
    pub default_durability: DurabilityLevel,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            resume_timeout_ms: 30_000,
            default_durability: DurabilityLevel::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults with runs stored under `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.root = root.into();
        config
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.storage.root.join(RUNS_DIR)
    }

    pub fn resume_timeout(&self) -> Duration {
        Duration::from_millis(self.execution.resume_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.storage.retry.policy()
    }

    pub fn validate(&self) -> Result<()> {
        if self.execution.max_workers == 0 {
            return Err(FlowError::Config("execution.max_workers must be at least 1".to_string()));
        }
        if self.execution.resume_timeout_ms == 0 {
            return Err(FlowError::Config(
                "execution.resume_timeout_ms must be positive".to_string(),
            ));
        }
        if self.storage.retry.max_attempts == 0 {
            return Err(FlowError::Config(
                "storage.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Layered configuration loader
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    files: Vec<PathBuf>,
    use_env: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            use_env: true,
        }
    }

    /// Add a file layer; missing files are skipped
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    /// Ignore the environment
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Merge every layer into the final configuration
    pub async fn load(&self) -> Result<EngineConfig> {
        let mut merged = toml::Value::try_from(EngineConfig::default())
            .map_err(|e| FlowError::Config(format!("Failed to encode defaults: {}", e)))?;

        for path in &self.files {
            match Self::read_layer(path).await? {
                Some(layer) => {
                    debug!(path = %path.display(), "Loaded config layer");
                    merge(&mut merged, layer);
                }
                None => debug!(path = %path.display(), "Config file not found, skipping"),
            }
        }

        let mut config: EngineConfig = merged
            .try_into()
            .map_err(|e| FlowError::Config(format!("Invalid configuration: {}", e)))?;

        if self.use_env {
            if let Ok(root) = std::env::var(ROOT_ENV_VAR) {
                debug!(root = %root, "Storage root taken from environment");
                config.storage.root = PathBuf::from(root);
            }
        }

        config.validate()?;
        Ok(config)
    }

    async fn read_layer(path: &Path) -> Result<Option<toml::Value>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(FlowError::Config(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let value = toml::from_str(&content).map_err(|e| {
            FlowError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(value))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Deep-merge `layer` into `base`; tables merge key by key, anything else
/// replaces
fn merge(base: &mut toml::Value, layer: toml::Value) {
    match (base, layer) {
        (toml::Value::Table(base), toml::Value::Table(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}
