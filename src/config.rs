//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.mimir/config.toml` (user)
//! 3. `/etc/mimir/config.toml` (system)
//!
//! Every field has a default, so an empty file (or no file at all with
//! [`Config::load_or_default`]) is a valid configuration. `MIMIR_*`
//! environment variables override file values.

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::StrategyKind;
use crate::model::{CacheConfig, PoolConfig};
use crate::queue::QueueConfig;
use crate::service::ServiceConfig;
use crate::{MimirError, Result};

/// Engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

/// Admission control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Queue capacity is twice this (default: 10).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    /// Requests executed at once (default: 4).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Execution limit and result wait for queued requests (default: 300).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// How long a submission may wait for queue space (default: 30).
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_secs: u64,
    /// Route requests through the admission queue (default: true).
    #[serde(default = "default_true")]
    pub enable_request_queue: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent(),
            max_workers: default_max_workers(),
            request_timeout_secs: default_request_timeout(),
            queue_timeout_secs: default_queue_timeout(),
            enable_request_queue: true,
        }
    }
}

/// Model residency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// `lru` (default) or `pooled`.
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Instances per model path for the pooled strategy (default: 3).
    #[serde(default = "default_capacity")]
    pub pool_size: usize,
    /// Resident models for the LRU strategy (default: 3).
    #[serde(default = "default_capacity")]
    pub cache_size: usize,
    /// Idle pooled instances older than this are removed (default: 300).
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,
    /// Cadence of the idle sweep (default: 60).
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
    /// Wait for a pooled instance (default: 30).
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            pool_size: default_capacity(),
            cache_size: default_capacity(),
            max_idle_secs: default_max_idle(),
            reap_interval_secs: default_reap_interval(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

/// Generation behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Hard limit on one inference call (default: 7200).
    #[serde(default = "default_inference_timeout")]
    pub inference_timeout_secs: u64,
    /// Requests per concurrent batch (default: 4).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Events buffered per token stream (default: 64).
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Models to preload at startup.
    #[serde(default)]
    pub warmup: Vec<PathBuf>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            inference_timeout_secs: default_inference_timeout(),
            batch_size: default_batch_size(),
            stream_buffer: default_stream_buffer(),
            warmup: Vec::new(),
        }
    }
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_workers() -> usize {
    4
}

fn default_request_timeout() -> u64 {
    300
}

fn default_queue_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_capacity() -> usize {
    3
}

fn default_max_idle() -> u64 {
    300
}

fn default_reap_interval() -> u64 {
    60
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_inference_timeout() -> u64 {
    7200
}

fn default_batch_size() -> usize {
    4
}

fn default_stream_buffer() -> usize {
    64
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.mimir/config.toml`
    /// 3. `/etc/mimir/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?.ok_or_else(|| {
            MimirError::Configuration(
                "No config file found. Create ~/.mimir/config.toml or /etc/mimir/config.toml"
                    .to_string(),
            )
        })?;
        Self::load_from_file(&path)
    }

    /// Like [`load`](Self::load), but falls back to defaults when no file
    /// exists. An explicit path that does not exist is still an error.
    pub fn load_or_default(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            MimirError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            MimirError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(MimirError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".mimir").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/mimir/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// Apply `MIMIR_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `MIMIR_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let c = &mut self.concurrency;
        override_with(&lookup, "MIMIR_MAX_CONCURRENT_REQUESTS", &mut c.max_concurrent_requests)?;
        override_with(&lookup, "MIMIR_MAX_WORKERS", &mut c.max_workers)?;
        override_with(&lookup, "MIMIR_REQUEST_TIMEOUT", &mut c.request_timeout_secs)?;
        override_with(&lookup, "MIMIR_QUEUE_TIMEOUT", &mut c.queue_timeout_secs)?;
        if let Some(raw) = lookup("MIMIR_ENABLE_REQUEST_QUEUE") {
            c.enable_request_queue = parse_bool("MIMIR_ENABLE_REQUEST_QUEUE", &raw)?;
        }

        let m = &mut self.models;
        override_with(&lookup, "MIMIR_MODEL_POOL_SIZE", &mut m.pool_size)?;
        override_with(&lookup, "MIMIR_MODEL_CACHE_SIZE", &mut m.cache_size)?;
        override_with(&lookup, "MIMIR_MAX_IDLE_SECS", &mut m.max_idle_secs)?;
        override_with(&lookup, "MIMIR_STRATEGY", &mut m.strategy)?;
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 9] = [
            ("concurrency.max_concurrent_requests", self.concurrency.max_concurrent_requests > 0),
            ("concurrency.max_workers", self.concurrency.max_workers > 0),
            ("concurrency.request_timeout_secs", self.concurrency.request_timeout_secs > 0),
            ("concurrency.queue_timeout_secs", self.concurrency.queue_timeout_secs > 0),
            ("models.pool_size", self.models.pool_size > 0),
            ("models.cache_size", self.models.cache_size > 0),
            ("models.acquire_timeout_secs", self.models.acquire_timeout_secs > 0),
            ("generation.inference_timeout_secs", self.generation.inference_timeout_secs > 0),
            ("generation.batch_size", self.generation.batch_size > 0),
        ];
        match checks.iter().find(|(_, ok)| !ok) {
            Some((field, _)) => Err(MimirError::Configuration(format!(
                "{field} must be greater than zero"
            ))),
            None => Ok(()),
        }
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| MimirError::Configuration(format!("Failed to render config: {e}")))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .max_instances(self.models.pool_size)
            .max_idle(Duration::from_secs(self.models.max_idle_secs))
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::default().max_models(self.models.cache_size)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::default()
            .max_concurrent(self.concurrency.max_concurrent_requests)
            .max_workers(self.concurrency.max_workers)
            .queue_timeout(Duration::from_secs(self.concurrency.queue_timeout_secs))
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig::default()
            .acquire_timeout(Duration::from_secs(self.models.acquire_timeout_secs))
            .inference_timeout(Duration::from_secs(self.generation.inference_timeout_secs))
            .batch_size(self.generation.batch_size)
            .stream_buffer(self.generation.stream_buffer)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.concurrency.request_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.models.reap_interval_secs)
    }
}

fn override_with<T, F>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| MimirError::Configuration(format!("Invalid value for {key}: {e}")))?;
    }
    Ok(())
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(MimirError::Configuration(format!(
            "Invalid value for {key}: expected a boolean, got {other:?}"
        ))),
    }
}
