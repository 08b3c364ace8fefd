//! Tests for the generation service over both instance strategies.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mimir::backend::{Loader, ModelBackend, ModelHandle};
use mimir::model::{CacheConfig, LruModelCache, ModelPoolManager, PoolConfig};
use mimir::service::{GenerationService, InstanceStrategy, ServiceConfig, WARMUP_SIZE_LIMIT};
use mimir::{
    Completion, FailureKind, GenerateRequest, InstanceStats, LoadError, LoadParams, LoadProfile,
    MimirError, Result, SamplingConfig, SamplingParams,
};

// ============================================================================
// Mock backend
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
enum Behavior {
    #[default]
    Answer,
    Fail,
    Panic,
    Hang,
}

/// Backend whose inference behavior can be switched between calls.
#[derive(Default)]
struct MockBackend {
    behavior: Mutex<Behavior>,
    infer_latency: Duration,
    sizes: Mutex<Vec<(PathBuf, u64)>>,
    loads: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    sampling: Mutex<Vec<SamplingConfig>>,
}

impl MockBackend {
    fn set(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    fn with_size(self, path: &str, size: u64) -> Self {
        self.sizes.lock().unwrap().push((PathBuf::from(path), size));
        self
    }
}

impl ModelBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn model_size(&self, path: &Path) -> std::io::Result<u64> {
        if path.starts_with("/missing") {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"));
        }
        let sizes = self.sizes.lock().unwrap();
        Ok(sizes
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, size)| *size)
            .unwrap_or(1024))
    }

    fn load(
        &self,
        path: &Path,
        _profile: &LoadProfile,
    ) -> std::result::Result<ModelHandle, LoadError> {
        if path.starts_with("/broken") {
            return Err(LoadError::new("unsupported format"));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(ModelHandle::new(path.to_path_buf()))
    }

    fn infer(
        &self,
        _model: &ModelHandle,
        prompt: &str,
        sampling: &SamplingConfig,
    ) -> Result<Completion> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.sampling.lock().unwrap().push(sampling.clone());
        std::thread::sleep(self.infer_latency);

        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            Behavior::Answer => Ok(Completion::new("  Paris.  ", 8, 2)),
            Behavior::Fail => Err(MimirError::InferenceFailure("kv cache exhausted".to_string())),
            Behavior::Panic => panic!("backend crashed"),
            Behavior::Hang => {
                std::thread::sleep(Duration::from_millis(300));
                Ok(Completion::new("late", 1, 1))
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn pooled(backend: Arc<MockBackend>, config: ServiceConfig) -> (GenerationService, Arc<ModelPoolManager>) {
    let loader = Arc::new(Loader::with_default_policy(backend.clone()));
    let manager = Arc::new(ModelPoolManager::new(
        loader,
        PoolConfig::new()
            .max_instances(1)
            .poll_interval(Duration::from_millis(10)),
    ));
    let service = GenerationService::new(
        backend,
        InstanceStrategy::Pooled(manager.clone()),
        config,
    );
    (service, manager)
}

fn lru(backend: Arc<MockBackend>, max_models: usize) -> GenerationService {
    let loader = Arc::new(Loader::with_default_policy(backend.clone()));
    let cache = LruModelCache::new(loader, CacheConfig::default().max_models(max_models));
    GenerationService::new(backend, InstanceStrategy::Lru(cache), ServiceConfig::default())
}

fn request(path: &str) -> GenerateRequest {
    GenerateRequest::new(path, "What is the capital of France?")
}

// ============================================================================
// Success path
// ============================================================================

#[tokio::test]
async fn successful_generation_fills_the_result() {
    let backend = Arc::new(MockBackend::default());
    let service = lru(backend.clone(), 2);

    let result = service.generate(request("/models/llama.gguf")).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.text.as_deref(), Some("Paris."));
    assert_eq!(result.model_used, "llama");
    assert_eq!(result.model_path, PathBuf::from("/models/llama.gguf"));
    assert_eq!(result.token_count, 2);
    assert_eq!(result.total_tokens, 10);
    assert!(result.error.is_none());
    assert!(result.failure.is_none());
    assert!(matches!(result.pool_stats, Some(InstanceStats::Lru(_))));

    let prompts = backend.prompts.lock().unwrap();
    assert_eq!(prompts[0], "Question: What is the capital of France?\n\nAnswer:");
}

#[tokio::test]
async fn custom_template_and_clamped_sampling_reach_the_backend() {
    let backend = Arc::new(MockBackend::default());
    let service = lru(backend.clone(), 1);

    let req = request("/models/llama.gguf")
        .template("<s>[INST] {question} [/INST]")
        .sampling(SamplingParams::new().max_tokens(0).temperature(5.0).top_k(500));
    assert!(service.generate(req).await.success);

    assert_eq!(
        backend.prompts.lock().unwrap()[0],
        "<s>[INST] What is the capital of France? [/INST]"
    );
    let sampling = backend.sampling.lock().unwrap()[0].clone();
    assert_eq!(sampling.max_tokens, 1);
    assert_eq!(sampling.temperature, 2.0);
    assert_eq!(sampling.top_k, 100);
}

#[tokio::test]
async fn lru_strategy_reuses_the_resident_model() {
    let backend = Arc::new(MockBackend::default());
    let service = lru(backend.clone(), 2);

    for _ in 0..3 {
        assert!(service.generate(request("/models/a.gguf")).await.success);
    }
    assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
    assert_eq!(service.cached_models().await, vec![PathBuf::from("/models/a.gguf")]);
}

// ============================================================================
// Failures never leak instances
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn instances_are_returned_after_every_outcome() {
    let backend = Arc::new(MockBackend::default());
    let (service, manager) = pooled(
        backend.clone(),
        ServiceConfig::default()
            .acquire_timeout(Duration::from_millis(200))
            .inference_timeout(Duration::from_secs(5)),
    );

    for behavior in [
        Behavior::Answer,
        Behavior::Fail,
        Behavior::Panic,
        Behavior::Answer,
        Behavior::Fail,
    ] {
        backend.set(behavior);
        let result = service.generate(request("/models/a.gguf")).await;
        assert_eq!(result.success, behavior == Behavior::Answer);

        let stats = manager.stats();
        let pool = &stats.pools["/models/a.gguf"];
        assert_eq!(pool.busy_instances, 0, "instance leaked after {behavior:?}");
    }

    // A single instance served every request.
    assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().summary.total_requests, 5);
}

#[tokio::test]
async fn inference_failure_is_reported_in_the_result() {
    let backend = Arc::new(MockBackend::default());
    backend.set(Behavior::Fail);
    let service = lru(backend, 1);

    let result = service.generate(request("/models/a.gguf")).await;
    assert!(!result.success);
    assert!(result.text.is_none());
    assert_eq!(result.failure, Some(FailureKind::InferenceFailure));
    assert!(result.error.unwrap().contains("kv cache exhausted"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backend_panic_becomes_a_failed_result() {
    let backend = Arc::new(MockBackend::default());
    backend.set(Behavior::Panic);
    let service = lru(backend, 1);

    let result = service.generate(request("/models/a.gguf")).await;
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::InferenceFailure));
    assert!(result.error.unwrap().contains("backend crashed"));
}

#[tokio::test]
async fn loader_failure_is_reported_in_the_result() {
    let service = lru(Arc::new(MockBackend::default()), 1);

    let result = service.generate(request("/broken/a.gguf")).await;
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::LoaderFailure));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_inference_times_out_and_frees_the_slot_at_once() {
    let backend = Arc::new(MockBackend::default());
    backend.set(Behavior::Hang);
    let (service, manager) = pooled(
        backend.clone(),
        ServiceConfig::default()
            .inference_timeout(Duration::from_millis(50))
            .acquire_timeout(Duration::from_millis(200)),
    );

    let result = service.generate(request("/models/a.gguf")).await;
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::InferenceFailure));
    assert!(result.processing_time_ms < 250);

    // The stalled instance left the pool; nothing is busy.
    let pool = &manager.stats().pools["/models/a.gguf"];
    assert_eq!(pool.busy_instances, 0);
    assert_eq!(pool.total_instances, 0);

    // The next request gets a fresh instance instead of waiting for the stall.
    backend.set(Behavior::Answer);
    let next = service.generate(request("/models/a.gguf")).await;
    assert!(next.success, "{:?}", next.error);
    assert_eq!(backend.loads.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let pool = &manager.stats().pools["/models/a.gguf"];
    assert_eq!(pool.total_instances, 1);
    assert_eq!(pool.busy_instances, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saturated_pool_reports_acquire_timeout() {
    let backend = Arc::new(MockBackend::default());
    backend.set(Behavior::Hang);
    let (service, _manager) = pooled(
        backend.clone(),
        ServiceConfig::default().acquire_timeout(Duration::from_millis(50)),
    );
    let service = Arc::new(service);

    let busy = {
        let service = service.clone();
        tokio::spawn(async move { service.generate(request("/models/a.gguf")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = service.generate(request("/models/a.gguf")).await;
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::AcquireTimeout));

    assert!(busy.await.unwrap().success);
}

// ============================================================================
// Statistics
// ============================================================================

#[tokio::test]
async fn stats_count_successes_failures_and_tokens() {
    let backend = Arc::new(MockBackend::default());
    let service = lru(backend.clone(), 1);

    service.generate(request("/models/a.gguf")).await;
    service.generate(request("/models/a.gguf")).await;
    backend.set(Behavior::Fail);
    service.generate(request("/models/a.gguf")).await;

    let stats = service.stats().await;
    assert_eq!(stats.generation.total_requests, 3);
    assert_eq!(stats.generation.successful_requests, 2);
    assert_eq!(stats.generation.failed_requests, 1);
    assert_eq!(stats.generation.concurrent_requests, 0);
    assert_eq!(stats.generation.total_tokens_generated, 4);
    assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(stats.instances.resident_instances(), 1);
    assert!(!stats.warmup_complete);
}

#[tokio::test]
async fn clear_cache_drops_models_and_resets_stats() {
    let service = lru(Arc::new(MockBackend::default()), 2);
    service.generate(request("/models/a.gguf")).await;
    service.generate(request("/models/b.gguf")).await;

    service.clear_cache().await;

    assert!(service.cached_models().await.is_empty());
    let stats = service.stats().await;
    assert_eq!(stats.generation.total_requests, 0);
    assert_eq!(stats.instances.resident_instances(), 0);
}

// ============================================================================
// Batches
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_results_keep_request_order() {
    let backend = Arc::new(MockBackend::default());
    let service = lru(backend, 3);

    let requests: Vec<GenerateRequest> = (0..5)
        .map(|i| request(&format!("/models/m{}.gguf", i % 2)).model_name(format!("req-{i}")))
        .chain(std::iter::once(request("/broken/x.gguf").model_name("req-5")))
        .collect();

    let results = service.generate_batch(requests, Some(2)).await;

    let names: Vec<&str> = results.iter().map(|r| r.model_used.as_str()).collect();
    assert_eq!(names, vec!["req-0", "req-1", "req-2", "req-3", "req-4", "req-5"]);
    assert!(results[..5].iter().all(|r| r.success));
    assert!(!results[5].success);
}

#[tokio::test]
async fn empty_batch_yields_no_results() {
    let service = lru(Arc::new(MockBackend::default()), 1);
    assert!(service.generate_batch(Vec::new(), None).await.is_empty());
}

// ============================================================================
// Warmup
// ============================================================================

#[tokio::test]
async fn warmup_skips_missing_and_oversized_models() {
    let backend = Arc::new(
        MockBackend::default().with_size("/models/huge.gguf", WARMUP_SIZE_LIMIT + 1),
    );
    let service = lru(backend.clone(), 3);

    let report = service
        .warmup(&[
            PathBuf::from("/models/a.gguf"),
            PathBuf::from("/missing/b.gguf"),
            PathBuf::from("/models/huge.gguf"),
            PathBuf::from("/broken/c.gguf"),
        ])
        .await;

    assert_eq!(report.requested, 4);
    assert_eq!(report.warmed, vec![PathBuf::from("/models/a.gguf")]);
    assert_eq!(
        report.skipped,
        vec![PathBuf::from("/missing/b.gguf"), PathBuf::from("/models/huge.gguf")]
    );
    assert_eq!(report.failed, vec![PathBuf::from("/broken/c.gguf")]);
    assert!(service.is_warm());
    assert!(service.stats().await.warmup_complete);

    // Warmup runs a single short inference per model.
    let sampling = backend.sampling.lock().unwrap()[0].clone();
    assert_eq!(sampling.max_tokens, 1);
    assert_eq!(backend.prompts.lock().unwrap()[0], "Test");
}

#[tokio::test]
async fn warmup_with_default_load_params_goes_through_the_strategy() {
    let backend = Arc::new(MockBackend::default());
    let (service, manager) = pooled(backend, ServiceConfig::default());

    let report = service.warmup(&[PathBuf::from("/models/a.gguf")]).await;
    assert_eq!(report.warmed.len(), 1);

    let stats = manager.stats();
    assert_eq!(stats.summary.total_instances, 1);
    assert_eq!(stats.pools["/models/a.gguf"].busy_instances, 0);

    // A later request with default parameters reuses the warmed instance.
    let result = service
        .generate(request("/models/a.gguf").load(LoadParams::default()))
        .await;
    assert!(result.success);
    assert_eq!(manager.stats().summary.total_cache_hits, 1);
}
