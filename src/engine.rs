//! Engine facade wiring backend, instance strategy, admission and reaper.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{Loader, ModelBackend, SizeTieredPolicy, TieringPolicy};
use crate::config::Config;
use crate::model::{CacheConfig, LruModelCache, ModelPoolManager, PoolConfig, ReaperHandle};
use crate::queue::{AdmissionQueue, QueueConfig};
use crate::service::{GenerationService, InstanceStrategy, ServiceConfig, TokenStream, WarmupReport};
use crate::types::{GenerateRequest, GenerationResult, QueueStats, ServiceStats};
use crate::{MimirError, Result};

/// Which instance strategy an engine runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Single instance per path with global LRU eviction.
    #[default]
    Lru,
    /// Fingerprint-aware multi-instance pools per path.
    Pooled,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lru => "lru",
            Self::Pooled => "pooled",
        })
    }
}

impl FromStr for StrategyKind {
    type Err = MimirError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "pooled" | "pool" => Ok(Self::Pooled),
            other => Err(MimirError::Configuration(format!(
                "unknown strategy {other:?}, expected \"lru\" or \"pooled\""
            ))),
        }
    }
}

/// Main entry point for creating engine instances.
pub struct Mimir;

impl Mimir {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> MimirBuilder {
        MimirBuilder::new()
    }
}

/// Builder for configuring engine instances.
pub struct MimirBuilder {
    backend: Option<Arc<dyn ModelBackend>>,
    tiering: Option<Arc<dyn TieringPolicy>>,
    strategy: StrategyKind,
    pool_config: PoolConfig,
    cache_config: CacheConfig,
    service_config: ServiceConfig,
    queue_config: Option<QueueConfig>,
    request_timeout: Duration,
    reap_interval: Option<Duration>,
}

impl Default for MimirBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MimirBuilder {
    pub fn new() -> Self {
        Self {
            backend: None,
            tiering: None,
            strategy: StrategyKind::default(),
            pool_config: PoolConfig::default(),
            cache_config: CacheConfig::default(),
            service_config: ServiceConfig::default(),
            queue_config: Some(QueueConfig::default()),
            request_timeout: Duration::from_secs(300),
            reap_interval: Some(Duration::from_secs(60)),
        }
    }

    /// Take every setting from a loaded [`Config`]. The backend still has to
    /// be supplied separately.
    pub fn from_config(self, config: &Config) -> Self {
        let queue_config = config
            .concurrency
            .enable_request_queue
            .then(|| config.queue_config());
        let reap_interval = Some(config.reap_interval()).filter(|d| !d.is_zero());
        Self {
            strategy: config.models.strategy,
            pool_config: config.pool_config(),
            cache_config: config.cache_config(),
            service_config: config.service_config(),
            queue_config,
            request_timeout: config.request_timeout(),
            reap_interval,
            ..self
        }
    }

    /// Set the model backend (required).
    pub fn backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Replace the default [`SizeTieredPolicy`].
    pub fn tiering(mut self, policy: Arc<dyn TieringPolicy>) -> Self {
        self.tiering = Some(policy);
        self
    }

    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    pub fn service_config(mut self, config: ServiceConfig) -> Self {
        self.service_config = config;
        self
    }

    /// Route `submit_generation` through an admission queue.
    pub fn queue(mut self, config: QueueConfig) -> Self {
        self.queue_config = Some(config);
        self
    }

    /// Serve `submit_generation` directly, without admission control.
    pub fn without_queue(mut self) -> Self {
        self.queue_config = None;
        self
    }

    /// Execution limit and result wait for queued requests.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Idle sweep cadence for the pooled strategy; `None` disables it.
    pub fn reap_interval(mut self, interval: Option<Duration>) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Build the engine. Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<Engine> {
        let backend = self.backend.ok_or_else(|| {
            MimirError::Configuration("No model backend configured".to_string())
        })?;
        tokio::runtime::Handle::try_current().map_err(|_| {
            MimirError::Configuration("Engine must be built inside a Tokio runtime".to_string())
        })?;
        if self.reap_interval.is_some_and(|d| d.is_zero()) {
            return Err(MimirError::Configuration(
                "reap interval must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(MimirError::Configuration(
                "request timeout must be greater than zero".to_string(),
            ));
        }
        if self.pool_config.max_instances == 0 {
            return Err(MimirError::Configuration(
                "pool size must be greater than zero".to_string(),
            ));
        }

        let policy = self
            .tiering
            .unwrap_or_else(|| Arc::new(SizeTieredPolicy::default()));
        let loader = Arc::new(Loader::new(Arc::clone(&backend), policy));

        let (strategy, reaper) = match self.strategy {
            StrategyKind::Lru => (
                InstanceStrategy::Lru(LruModelCache::new(loader, self.cache_config)),
                None,
            ),
            StrategyKind::Pooled => {
                let manager = Arc::new(ModelPoolManager::new(loader, self.pool_config));
                let reaper = self
                    .reap_interval
                    .map(|interval| manager.spawn_reaper(interval));
                (InstanceStrategy::Pooled(manager), reaper)
            }
        };

        info!(
            backend = backend.name(),
            strategy = %self.strategy,
            queue = self.queue_config.is_some(),
            "engine ready"
        );

        let service = Arc::new(GenerationService::new(
            backend,
            strategy,
            self.service_config,
        ));
        Ok(Engine {
            service,
            queue: self.queue_config.map(AdmissionQueue::new),
            request_timeout: self.request_timeout,
            reaper,
        })
    }
}

/// The in-process generation API.
pub struct Engine {
    service: Arc<GenerationService>,
    queue: Option<AdmissionQueue<GenerationResult>>,
    request_timeout: Duration,
    reaper: Option<ReaperHandle>,
}

impl Engine {
    /// Serve one request, through the admission queue when one is enabled.
    ///
    /// Never returns an error: queue rejections and result timeouts come
    /// back as failed results like any other failure.
    pub async fn submit_generation(&self, request: GenerateRequest) -> GenerationResult {
        let Some(queue) = &self.queue else {
            return self.service.generate(request).await;
        };

        let started = Instant::now();
        let name = request.model_name.clone();
        let path = request.model_path.clone();
        let service = Arc::clone(&self.service);

        let outcome = match queue
            .submit(
                async move { Ok(service.generate(request).await) },
                0,
                Some(self.request_timeout),
            )
            .await
        {
            Ok(id) => queue.await_result(id, self.request_timeout).await,
            Err(e) => Err(e),
        };

        outcome.unwrap_or_else(|e| {
            warn!(error = %e, model = %name, "queued generation did not complete");
            GenerationResult::failed(name, path, &e, started.elapsed())
        })
    }

    /// Serve requests in concurrent batches, bypassing the admission queue.
    pub async fn generate_batch(
        &self,
        requests: Vec<GenerateRequest>,
        batch_size: Option<usize>,
    ) -> Vec<GenerationResult> {
        self.service.generate_batch(requests, batch_size).await
    }

    pub async fn generate_stream(&self, request: GenerateRequest) -> Result<TokenStream> {
        self.service.generate_stream(request).await
    }

    pub async fn warmup(&self, paths: &[PathBuf]) -> WarmupReport {
        self.service.warmup(paths).await
    }

    pub async fn stats(&self) -> ServiceStats {
        self.service.stats().await
    }

    /// Admission queue counters, if the queue is enabled.
    pub fn concurrency_stats(&self) -> Option<QueueStats> {
        self.queue.as_ref().map(AdmissionQueue::stats)
    }

    pub async fn cached_models(&self) -> Vec<PathBuf> {
        self.service.cached_models().await
    }

    /// Drop every resident model instance and reset statistics.
    pub async fn clear_cache(&self) {
        self.service.clear_cache().await;
    }

    pub fn service(&self) -> &GenerationService {
        &self.service
    }

    pub fn queue(&self) -> Option<&AdmissionQueue<GenerationResult>> {
        self.queue.as_ref()
    }

    /// Stop admission and the idle reaper. Waits up to `grace` for running
    /// requests to finish.
    pub async fn shutdown(&self, grace: Option<Duration>) {
        if let Some(reaper) = &self.reaper {
            reaper.abort();
        }
        if let Some(queue) = &self.queue {
            queue.shutdown(grace).await;
        }
        info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EchoBackend;

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("LRU".parse::<StrategyKind>().unwrap(), StrategyKind::Lru);
        assert_eq!(" pooled ".parse::<StrategyKind>().unwrap(), StrategyKind::Pooled);
        assert!("fifo".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn build_requires_backend() {
        let err = Mimir::builder().build().err().unwrap();
        assert!(matches!(err, MimirError::Configuration(_)));
    }

    #[test]
    fn build_requires_runtime() {
        let err = Mimir::builder()
            .backend(Arc::new(EchoBackend::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("Tokio runtime"));
    }

    #[tokio::test]
    async fn from_config_disables_queue() {
        let mut config = Config::default();
        config.concurrency.enable_request_queue = false;
        let engine = Mimir::builder()
            .from_config(&config)
            .backend(Arc::new(EchoBackend::new()))
            .build()
            .unwrap();
        assert!(engine.concurrency_stats().is_none());
    }
}
