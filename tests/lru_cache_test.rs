//! Tests for the single-instance LRU model cache.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use mimir::backend::{Loader, ModelBackend, ModelHandle};
use mimir::model::{CacheConfig, LruModelCache};
use mimir::{
    Completion, LoadError, LoadParams, LoadProfile, MimirError, Result, SamplingConfig,
};

// ============================================================================
// Mock backend
// ============================================================================

/// Records every load attempt and unload; fails the first `failures` loads.
#[derive(Default)]
struct RecordingBackend {
    failures: Mutex<usize>,
    attempts: Mutex<Vec<(PathBuf, LoadProfile)>>,
    unloaded: Mutex<Vec<PathBuf>>,
}

impl RecordingBackend {
    fn failing(failures: usize) -> Self {
        Self {
            failures: Mutex::new(failures),
            ..Default::default()
        }
    }

    fn attempts(&self) -> Vec<(PathBuf, LoadProfile)> {
        self.attempts.lock().unwrap().clone()
    }

    fn unloaded(&self) -> Vec<PathBuf> {
        self.unloaded.lock().unwrap().clone()
    }
}

impl ModelBackend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    fn model_size(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(1024 * 1024)
    }

    fn load(
        &self,
        path: &Path,
        profile: &LoadProfile,
    ) -> std::result::Result<ModelHandle, LoadError> {
        self.attempts
            .lock()
            .unwrap()
            .push((path.to_path_buf(), profile.clone()));
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(LoadError::new("out of memory"));
        }
        Ok(ModelHandle::new(path.to_path_buf()))
    }

    fn infer(
        &self,
        _model: &ModelHandle,
        _prompt: &str,
        _sampling: &SamplingConfig,
    ) -> Result<Completion> {
        Ok(Completion::new("ok", 1, 1))
    }

    fn unload(&self, model: &ModelHandle) {
        if let Some(path) = model.downcast_ref::<PathBuf>() {
            self.unloaded.lock().unwrap().push(path.clone());
        }
    }
}

fn cache(backend: Arc<RecordingBackend>, max_models: usize) -> LruModelCache {
    let loader = Arc::new(Loader::with_default_policy(backend));
    LruModelCache::new(loader, CacheConfig::default().max_models(max_models))
}

fn path(name: &str) -> PathBuf {
    PathBuf::from(format!("/models/{name}.gguf"))
}

// ============================================================================
// Eviction
// ============================================================================

#[tokio::test]
async fn least_recently_used_model_is_evicted() {
    let backend = Arc::new(RecordingBackend::default());
    let cache = cache(backend.clone(), 2);
    let params = LoadParams::new();

    cache.get_or_load(&path("a"), &params).await.unwrap();
    cache.get_or_load(&path("b"), &params).await.unwrap();
    // Touch A so B becomes the eviction candidate.
    cache.get_or_load(&path("a"), &params).await.unwrap();
    cache.get_or_load(&path("c"), &params).await.unwrap();

    assert!(cache.contains(&path("a")).await);
    assert!(!cache.contains(&path("b")).await);
    assert!(cache.contains(&path("c")).await);
    assert_eq!(backend.unloaded(), vec![path("b")]);

    let stats = cache.stats().await;
    assert_eq!(stats.total_models, 2);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 3);
    assert_eq!(stats.evictions, 1);
}

#[tokio::test]
async fn eviction_order_follows_access_order_exactly() {
    let backend = Arc::new(RecordingBackend::default());
    let cache = cache(backend.clone(), 3);
    let params = LoadParams::new();

    for name in ["a", "b", "c"] {
        cache.get_or_load(&path(name), &params).await.unwrap();
    }
    for name in ["c", "a", "b"] {
        cache.get_or_load(&path(name), &params).await.unwrap();
    }
    assert_eq!(cache.model_paths().await, vec![path("c"), path("a"), path("b")]);

    cache.get_or_load(&path("d"), &params).await.unwrap();
    cache.get_or_load(&path("e"), &params).await.unwrap();
    assert_eq!(backend.unloaded(), vec![path("c"), path("a")]);
    assert_eq!(cache.model_paths().await, vec![path("b"), path("d"), path("e")]);
}

#[tokio::test]
async fn zero_capacity_still_holds_one_model() {
    let backend = Arc::new(RecordingBackend::default());
    let cache = cache(backend.clone(), 0);
    assert_eq!(cache.max_models(), 1);

    cache.get_or_load(&path("a"), &LoadParams::new()).await.unwrap();
    cache.get_or_load(&path("b"), &LoadParams::new()).await.unwrap();
    assert_eq!(cache.len().await, 1);
    assert_eq!(backend.unloaded(), vec![path("a")]);
}

// ============================================================================
// Hits and usage
// ============================================================================

#[tokio::test]
async fn hits_return_the_resident_handle_and_count_usage() {
    let backend = Arc::new(RecordingBackend::default());
    let cache = cache(backend.clone(), 2);

    let first = cache
        .get_or_load(&path("a"), &LoadParams::new().n_ctx(2048))
        .await
        .unwrap();
    // Different parameters on a hit do not trigger a reload.
    let second = cache
        .get_or_load(&path("a"), &LoadParams::new().n_ctx(8192))
        .await
        .unwrap();

    assert!(first.handle.ptr_eq(&second.handle));
    assert_eq!(first.usage_count, 1);
    assert_eq!(second.usage_count, 2);
    assert_eq!(backend.attempts().len(), 1);

    let stats = cache.stats().await;
    assert_eq!(stats.usage_stats[&path("a").display().to_string()].usage_count, 2);
    assert_eq!(stats.hit_rate, 50.0);
}

#[tokio::test]
async fn overrides_apply_on_top_of_the_tier_profile() {
    let backend = Arc::new(RecordingBackend::default());
    let cache = cache(backend.clone(), 1);

    cache
        .get_or_load(&path("a"), &LoadParams::new().n_ctx(2048))
        .await
        .unwrap();

    let attempts = backend.attempts();
    let (_, profile) = &attempts[0];
    assert_eq!(profile.n_ctx, 2048);
    // Remaining fields come from the small-model tier.
    assert_eq!(profile.n_gpu_layers, -1);
    assert_eq!(profile.n_batch, 512);
}

// ============================================================================
// Load failures
// ============================================================================

#[tokio::test]
async fn failed_load_is_retried_once_with_safe_parameters() {
    let backend = Arc::new(RecordingBackend::failing(1));
    let cache = cache(backend.clone(), 1);

    cache
        .get_or_load(&path("a"), &LoadParams::new().n_ctx(8192))
        .await
        .unwrap();

    let attempts = backend.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].1.n_ctx, 8192);
    assert_eq!(attempts[1].1.n_ctx, 1024);
    assert_eq!(attempts[1].1.n_gpu_layers, 0);
    assert!(cache.contains(&path("a")).await);
}

#[tokio::test]
async fn second_failure_is_a_loader_failure() {
    let backend = Arc::new(RecordingBackend::failing(2));
    let cache = cache(backend.clone(), 1);

    let err = cache
        .get_or_load(&path("a"), &LoadParams::new())
        .await
        .unwrap_err();

    match &err {
        MimirError::LoaderFailure { path: p, source } => {
            assert!(p.contains("a.gguf"));
            assert_eq!(source.message(), "out of memory");
        }
        other => panic!("expected LoaderFailure, got {other:?}"),
    }
    assert_eq!(backend.attempts().len(), 2);
    assert!(cache.is_empty().await);
}

// ============================================================================
// Clear
// ============================================================================

#[tokio::test]
async fn clear_unloads_everything_and_resets_counters() {
    let backend = Arc::new(RecordingBackend::default());
    let cache = cache(backend.clone(), 3);
    let params = LoadParams::new();

    cache.get_or_load(&path("a"), &params).await.unwrap();
    cache.get_or_load(&path("b"), &params).await.unwrap();
    cache.get_or_load(&path("a"), &params).await.unwrap();

    cache.clear().await;

    assert!(cache.is_empty().await);
    let mut unloaded = backend.unloaded();
    unloaded.sort();
    assert_eq!(unloaded, vec![path("a"), path("b")]);

    let stats = cache.stats().await;
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.misses, 0);
    assert!(stats.model_paths.is_empty());
}
