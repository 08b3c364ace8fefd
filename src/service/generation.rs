//! Generation orchestration.
//!
//! Per request: sanitize sampling, check out a model instance, build the
//! prompt, run inference on the blocking pool under a hard timeout, record
//! statistics, and return a [`GenerationResult`]. The instance is always
//! handed back: it travels into the blocking closure and is released when the
//! backend call returns, whether it succeeded, failed or panicked. A pooled
//! instance whose call overruns the deadline is retired from its pool, so the
//! slot frees up as soon as the request fails.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::prompt::build_prompt;
use super::stream::{DEFAULT_STREAM_BUFFER, TokenStream, blocking_stream};
use crate::backend::{ModelBackend, ModelHandle};
use crate::model::{
    CachedInstance, InstanceLease, LruModelCache, ModelPoolManager, RetireToken,
};
use crate::queue::panic_message;
use crate::sync::lock;
use crate::telemetry;
use crate::types::{
    Completion, GenerateEvent, GenerateRequest, GenerationResult, GenerationStats, InstanceStats,
    LoadParams, SamplingConfig, SamplingParams, ServiceStats,
};
use crate::{MimirError, Result};

/// Files larger than this are not preloaded by [`GenerationService::warmup`].
pub const WARMUP_SIZE_LIMIT: u64 = 15 * 1024 * 1024 * 1024;

/// Configuration for a [`GenerationService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long to wait for a pooled instance. Default: 30s.
    pub acquire_timeout: Duration,
    /// Hard limit on a single inference call. Default: 2h.
    pub inference_timeout: Duration,
    /// Requests run concurrently per batch. Default: 4.
    pub batch_size: usize,
    /// Events buffered per token stream. Default: 64.
    pub stream_buffer: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
            inference_timeout: Duration::from_secs(7200),
            batch_size: 4,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

impl ServiceConfig {
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn inference_timeout(mut self, timeout: Duration) -> Self {
        self.inference_timeout = timeout;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn stream_buffer(mut self, size: usize) -> Self {
        self.stream_buffer = size;
        self
    }
}

/// Where model instances come from.
pub enum InstanceStrategy {
    /// One instance per path, global cap, least recently used evicted.
    Lru(LruModelCache),
    /// Several fingerprint-keyed instances per path, leased exclusively.
    Pooled(Arc<ModelPoolManager>),
}

impl InstanceStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lru(_) => "lru",
            Self::Pooled(_) => "pooled",
        }
    }

    async fn checkout(
        &self,
        path: &Path,
        params: &LoadParams,
        timeout: Duration,
    ) -> Result<Checkout> {
        match self {
            Self::Lru(cache) => cache.get_or_load(path, params).await.map(Checkout::Cached),
            Self::Pooled(manager) => manager
                .get_instance(path, params, timeout)
                .await
                .map(Checkout::Leased),
        }
    }

    pub async fn stats(&self) -> InstanceStats {
        match self {
            Self::Lru(cache) => InstanceStats::Lru(cache.stats().await),
            Self::Pooled(manager) => InstanceStats::Pooled(manager.stats()),
        }
    }

    pub async fn model_paths(&self) -> Vec<PathBuf> {
        match self {
            Self::Lru(cache) => cache.model_paths().await,
            Self::Pooled(manager) => manager.model_paths(),
        }
    }

    pub async fn clear(&self) {
        match self {
            Self::Lru(cache) => cache.clear().await,
            Self::Pooled(manager) => manager.clear(),
        }
    }
}

/// A checked-out instance. Dropping a leased one returns it to its pool.
enum Checkout {
    Cached(CachedInstance),
    Leased(InstanceLease),
}

impl Checkout {
    fn handle(&self) -> &ModelHandle {
        match self {
            Self::Cached(instance) => &instance.handle,
            Self::Leased(lease) => lease.handle(),
        }
    }

    /// Cached models are shared and never retired.
    fn retire_token(&self) -> Option<RetireToken> {
        match self {
            Self::Cached(_) => None,
            Self::Leased(lease) => Some(lease.retire_token()),
        }
    }
}

/// Outcome of [`GenerationService::warmup`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WarmupReport {
    pub requested: usize,
    pub warmed: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Counts a request as finished even if the future is dropped mid-flight.
struct InFlight<'a> {
    stats: &'a Mutex<GenerationStats>,
    started: Instant,
    done: bool,
}

impl<'a> InFlight<'a> {
    fn begin(stats: &'a Mutex<GenerationStats>) -> Self {
        lock(stats).begin();
        Self {
            stats,
            started: Instant::now(),
            done: false,
        }
    }

    fn finish(mut self, tokens: u64, success: bool) -> Duration {
        self.done = true;
        let elapsed = self.started.elapsed();
        lock(self.stats).finish(elapsed.as_secs_f64() * 1000.0, tokens, success);
        elapsed
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.done {
            let ms = self.started.elapsed().as_secs_f64() * 1000.0;
            lock(self.stats).finish(ms, 0, false);
        }
    }
}

/// Orchestrates generation requests over one instance strategy.
pub struct GenerationService {
    backend: Arc<dyn ModelBackend>,
    strategy: InstanceStrategy,
    config: ServiceConfig,
    stats: Mutex<GenerationStats>,
    warmup_complete: AtomicBool,
}

impl GenerationService {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        strategy: InstanceStrategy,
        config: ServiceConfig,
    ) -> Self {
        Self {
            backend,
            strategy,
            config,
            stats: Mutex::new(GenerationStats::default()),
            warmup_complete: AtomicBool::new(false),
        }
    }

    pub fn strategy(&self) -> &InstanceStrategy {
        &self.strategy
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Serve one request. Never returns an error: failures are reported in
    /// the result with `success == false`.
    #[instrument(skip_all, fields(model = %request.model_name, strategy = self.strategy.name()))]
    pub async fn generate(&self, request: GenerateRequest) -> GenerationResult {
        let in_flight = InFlight::begin(&self.stats);

        match self.run(&request).await {
            Ok(completion) => {
                let tokens = completion.usage.completion_tokens;
                let elapsed = in_flight.finish(tokens as u64, true);
                self.record("success", elapsed, tokens);
                info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    tokens, "generation complete"
                );
                let instances = self.strategy.stats().await;
                GenerationResult::completed(&request, completion, elapsed, instances)
            }
            Err(e) => {
                let elapsed = in_flight.finish(0, false);
                self.record(e.kind().as_str(), elapsed, 0);
                error!(error = %e, elapsed_ms = elapsed.as_millis() as u64, "generation failed");
                GenerationResult::failed(
                    request.model_name.clone(),
                    request.model_path.clone(),
                    &e,
                    elapsed,
                )
            }
        }
    }

    async fn run(&self, request: &GenerateRequest) -> Result<Completion> {
        let sampling = request.sampling.sanitize();
        let checkout = self
            .strategy
            .checkout(&request.model_path, &request.load, self.config.acquire_timeout)
            .await?;
        let prompt = build_prompt(request.template.as_deref(), &request.question);
        debug!(
            prompt_chars = prompt.len(),
            max_tokens = sampling.max_tokens,
            temperature = sampling.temperature,
            "running inference"
        );

        self.infer_detached(checkout, prompt, sampling).await
    }

    /// Run inference on the blocking pool, bounded by the inference timeout.
    ///
    /// The checkout is released when the backend returns. On timeout a
    /// leased instance is retired instead of being left busy.
    async fn infer_detached(
        &self,
        checkout: Checkout,
        prompt: String,
        sampling: SamplingConfig,
    ) -> Result<Completion> {
        let retire = checkout.retire_token();
        let backend = Arc::clone(&self.backend);
        let inference = tokio::task::spawn_blocking(move || {
            let result = backend.infer(checkout.handle(), &prompt, &sampling);
            drop(checkout);
            result
        });

        let limit = self.config.inference_timeout;
        match tokio::time::timeout(limit, inference).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) if join.is_panic() => Err(MimirError::InferenceFailure(
                panic_message(join.into_panic().as_ref()),
            )),
            Ok(Err(join)) => Err(MimirError::InferenceFailure(join.to_string())),
            Err(_) => {
                if let Some(token) = retire {
                    token.retire();
                }
                Err(MimirError::InferenceTimeout(limit))
            }
        }
    }

    fn record(&self, status: &'static str, elapsed: Duration, tokens: u32) {
        let strategy = self.strategy.name();
        metrics::counter!(telemetry::GENERATIONS_TOTAL, "status" => status, "strategy" => strategy)
            .increment(1);
        metrics::histogram!(telemetry::GENERATION_DURATION_SECONDS, "strategy" => strategy)
            .record(elapsed.as_secs_f64());
        if tokens > 0 {
            metrics::counter!(telemetry::TOKENS_TOTAL, "strategy" => strategy)
                .increment(tokens as u64);
        }
    }

    /// Serve `requests` in consecutive batches of `batch_size` (or the
    /// configured default), each batch concurrently.
    ///
    /// Results come back in request order. A request that panics becomes a
    /// failed result; the rest of its batch is unaffected.
    pub async fn generate_batch(
        &self,
        requests: Vec<GenerateRequest>,
        batch_size: Option<usize>,
    ) -> Vec<GenerationResult> {
        let size = batch_size.unwrap_or(self.config.batch_size).max(1);
        let mut results = Vec::with_capacity(requests.len());
        let mut pending = requests.into_iter().peekable();

        while pending.peek().is_some() {
            let batch: Vec<GenerateRequest> = pending.by_ref().take(size).collect();
            debug!(size = batch.len(), "running generation batch");
            let runs = batch.into_iter().map(|request| {
                let name = request.model_name.clone();
                let path = request.model_path.clone();
                let started = Instant::now();
                async move {
                    match AssertUnwindSafe(self.generate(request)).catch_unwind().await {
                        Ok(result) => result,
                        Err(panic) => {
                            let e = MimirError::InferenceFailure(panic_message(panic.as_ref()));
                            GenerationResult::failed(name, path, &e, started.elapsed())
                        }
                    }
                }
            });
            results.extend(join_all(runs).await);
        }
        results
    }

    /// Stream tokens for one request.
    ///
    /// Checkout failures are returned directly. Once streaming starts, a
    /// backend failure arrives as the final `Err` item. Streams are not
    /// counted in the service statistics and have no inference timeout; the
    /// instance is released when the backend stops producing.
    pub async fn generate_stream(&self, request: GenerateRequest) -> Result<TokenStream> {
        let sampling = request.sampling.sanitize();
        let checkout = self
            .strategy
            .checkout(&request.model_path, &request.load, self.config.acquire_timeout)
            .await?;
        let prompt = build_prompt(request.template.as_deref(), &request.question);
        let backend = Arc::clone(&self.backend);

        Ok(blocking_stream(self.config.stream_buffer, move |emit| {
            let result = backend.infer_streaming(checkout.handle(), &prompt, &sampling, &mut |chunk: &str| {
                emit(Ok(GenerateEvent::Token(chunk.to_string())))
            });
            drop(checkout);
            match result {
                Ok(completion) => {
                    emit(Ok(GenerateEvent::Done {
                        finish_reason: completion.finish_reason,
                        completion_tokens: completion.usage.completion_tokens,
                    }));
                }
                Err(e) => {
                    emit(Err(e));
                }
            }
        }))
    }

    /// Preload models and run a one-token inference on each.
    ///
    /// Missing files and files over [`WARMUP_SIZE_LIMIT`] are skipped; a
    /// failure on one path does not stop the others.
    pub async fn warmup(&self, paths: &[PathBuf]) -> WarmupReport {
        info!(count = paths.len(), "warming up models");
        let mut report = WarmupReport {
            requested: paths.len(),
            ..WarmupReport::default()
        };

        for path in paths {
            match self.backend.model_size(path) {
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "model file not found, skipping warmup");
                    report.skipped.push(path.clone());
                    continue;
                }
                Ok(size) if size > WARMUP_SIZE_LIMIT => {
                    info!(path = %path.display(), size_gb = size as f64 / (1024.0 * 1024.0 * 1024.0), "skipping warmup for large model");
                    report.skipped.push(path.clone());
                    continue;
                }
                Ok(_) => {}
            }

            match self.warm_one(path).await {
                Ok(()) => {
                    info!(path = %path.display(), "warmed up model");
                    report.warmed.push(path.clone());
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to warm up model");
                    report.failed.push(path.clone());
                }
            }
        }

        self.warmup_complete.store(true, Ordering::SeqCst);
        info!(
            warmed = report.warmed.len(),
            requested = report.requested,
            "model warmup complete"
        );
        report
    }

    async fn warm_one(&self, path: &Path) -> Result<()> {
        let checkout = self
            .strategy
            .checkout(path, &LoadParams::default(), self.config.acquire_timeout)
            .await?;
        let sampling = SamplingParams::new()
            .max_tokens(1)
            .temperature(0.1)
            .sanitize();
        self.infer_detached(checkout, "Test".to_string(), sampling)
            .await
            .map(|_| ())
    }

    /// Drop every resident instance and reset the statistics.
    ///
    /// Requests still in flight stay counted in the fresh statistics, so
    /// their completion keeps the totals consistent.
    pub async fn clear_cache(&self) {
        self.strategy.clear().await;
        lock(&self.stats).reset();
        info!(strategy = self.strategy.name(), "generation service cache cleared");
    }

    /// Paths with a resident instance.
    pub async fn cached_models(&self) -> Vec<PathBuf> {
        self.strategy.model_paths().await
    }

    pub fn is_warm(&self) -> bool {
        self.warmup_complete.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> ServiceStats {
        let generation = lock(&self.stats).clone();
        ServiceStats {
            avg_tokens_per_second: generation.tokens_per_second(),
            success_rate: generation.success_rate(),
            generation,
            instances: self.strategy.stats().await,
            warmup_complete: self.is_warm(),
        }
    }
}
