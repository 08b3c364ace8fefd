//! Single-instance-per-path model cache with least-recently-used eviction.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::Result;
use crate::backend::{Loader, ModelHandle};
use crate::telemetry;
use crate::types::{CacheStats, LoadParams, ModelUsage, percent};

/// Configuration for an [`LruModelCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Resident model limit. Values below 1 are treated as 1. Default: 3.
    pub max_models: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_models: 3 }
    }
}

impl CacheConfig {
    pub fn max_models(mut self, n: usize) -> Self {
        self.max_models = n;
        self
    }
}

#[derive(Debug)]
struct CachedModel {
    handle: ModelHandle,
    usage_count: u64,
    last_used: Instant,
}

struct CacheState {
    models: LruCache<PathBuf, CachedModel>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            models: LruCache::new(capacity),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }
}

/// A model checked out of the cache.
///
/// Holding one does not pin the model: a later miss may evict it, and the
/// holder keeps a handle the backend has been told to unload. Callers that
/// need exclusive, eviction-proof access use the pooled strategy instead.
#[derive(Debug, Clone)]
pub struct CachedInstance {
    pub model_path: PathBuf,
    pub handle: ModelHandle,
    /// Number of times the model has been handed out, this checkout included.
    pub usage_count: u64,
}

/// At most `max_models` loaded models, one per path.
///
/// Every lookup, including the load on a miss, runs under one async lock, so
/// loads are serialized and eviction order is exact LRU.
pub struct LruModelCache {
    loader: Arc<Loader>,
    capacity: NonZeroUsize,
    state: Mutex<CacheState>,
}

impl LruModelCache {
    pub fn new(loader: Arc<Loader>, config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_models).unwrap_or(NonZeroUsize::MIN);
        Self {
            loader,
            capacity,
            state: Mutex::new(CacheState::new(capacity)),
        }
    }

    pub fn max_models(&self) -> usize {
        self.capacity.get()
    }

    /// Return the cached model for `path`, loading it on a miss.
    ///
    /// `params` only matter on a miss; a resident model is returned as-is
    /// whatever parameters it was loaded with.
    pub async fn get_or_load(&self, path: &Path, params: &LoadParams) -> Result<CachedInstance> {
        let mut state = self.state.lock().await;

        if let Some(model) = state.models.get_mut(path) {
            model.usage_count += 1;
            model.last_used = Instant::now();
            let instance = CachedInstance {
                model_path: path.to_path_buf(),
                handle: model.handle.clone(),
                usage_count: model.usage_count,
            };
            state.hits += 1;
            metrics::counter!(telemetry::CACHE_LOOKUPS_TOTAL, "outcome" => "hit").increment(1);
            debug!(path = %path.display(), uses = instance.usage_count, "model cache hit");
            return Ok(instance);
        }

        state.misses += 1;
        metrics::counter!(telemetry::CACHE_LOOKUPS_TOTAL, "outcome" => "miss").increment(1);

        // Evict before loading so the outgoing model is unloaded first.
        while state.models.len() >= self.capacity.get() {
            let Some((victim, evicted)) = state.models.pop_lru() else {
                break;
            };
            self.loader.unload(&evicted.handle);
            state.evictions += 1;
            metrics::counter!(telemetry::MODEL_EVICTIONS_TOTAL, "reason" => "lru").increment(1);
            info!(path = %victim.display(), uses = evicted.usage_count, "evicted least recently used model");
        }

        let handle = self
            .loader
            .load_blocking(path.to_path_buf(), params.clone())
            .await?;

        state.models.put(
            path.to_path_buf(),
            CachedModel {
                handle: handle.clone(),
                usage_count: 1,
                last_used: Instant::now(),
            },
        );
        info!(path = %path.display(), resident = state.models.len(), "cached model");

        Ok(CachedInstance {
            model_path: path.to_path_buf(),
            handle,
            usage_count: 1,
        })
    }

    /// Unload every model and reset the counters.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        let count = state.models.len();
        while let Some((_, model)) = state.models.pop_lru() {
            self.loader.unload(&model.handle);
        }
        *state = CacheState::new(self.capacity);
        if count > 0 {
            metrics::counter!(telemetry::MODEL_EVICTIONS_TOTAL, "reason" => "clear")
                .increment(count as u64);
        }
        info!(count, "cleared model cache");
    }

    pub async fn contains(&self, path: &Path) -> bool {
        self.state.lock().await.models.contains(path)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.models.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Resident paths, least recently used first.
    pub async fn model_paths(&self) -> Vec<PathBuf> {
        let state = self.state.lock().await;
        state.models.iter().rev().map(|(path, _)| path.clone()).collect()
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let now = Instant::now();

        let mut model_paths: Vec<String> = state
            .models
            .iter()
            .map(|(p, _)| p.display().to_string())
            .collect();
        model_paths.sort();

        let usage_stats: BTreeMap<String, ModelUsage> = state
            .models
            .iter()
            .map(|(path, model)| {
                (
                    path.display().to_string(),
                    ModelUsage {
                        usage_count: model.usage_count,
                        last_used_secs_ago: now
                            .saturating_duration_since(model.last_used)
                            .as_secs_f64(),
                    },
                )
            })
            .collect();

        CacheStats {
            total_models: state.models.len(),
            max_models: self.capacity.get(),
            model_paths,
            usage_stats,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            hit_rate: percent(state.hits, state.hits + state.misses),
        }
    }
}

impl std::fmt::Debug for LruModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruModelCache")
            .field("max_models", &self.capacity)
            .finish()
    }
}
