//! Registry of per-path model pools.
//!
//! Pools are created lazily on first use with double-checked locking, so two
//! callers racing on a new path still end up sharing one pool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use super::{InstanceLease, ModelPool, PoolConfig};
use crate::Result;
use crate::backend::Loader;
use crate::sync::{read, write};
use crate::types::{LoadParams, ManagerStats, percent};

/// Owns one [`ModelPool`] per distinct model path.
pub struct ModelPoolManager {
    pools: RwLock<HashMap<PathBuf, Arc<ModelPool>>>,
    loader: Arc<Loader>,
    config: PoolConfig,
}

impl ModelPoolManager {
    pub fn new(loader: Arc<Loader>, config: PoolConfig) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            loader,
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get or lazily create the pool for `path`.
    pub fn pool(&self, path: &Path) -> Arc<ModelPool> {
        // Fast path: pool already exists
        {
            let pools = read(&self.pools);
            if let Some(pool) = pools.get(path) {
                return Arc::clone(pool);
            }
        }

        let mut pools = write(&self.pools);

        // Double-check after acquiring write lock
        if let Some(pool) = pools.get(path) {
            return Arc::clone(pool);
        }

        let pool = Arc::new(ModelPool::new(
            path,
            Arc::clone(&self.loader),
            self.config.clone(),
        ));
        pools.insert(path.to_path_buf(), Arc::clone(&pool));
        debug!(path = %path.display(), "created model pool");
        pool
    }

    /// Acquire an instance of the model at `path`, creating its pool if needed.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn get_instance(
        &self,
        path: &Path,
        params: &LoadParams,
        timeout: Duration,
    ) -> Result<InstanceLease> {
        self.pool(path).acquire(params, timeout).await
    }

    /// Return an instance to the pool it came from.
    pub fn return_instance(&self, lease: InstanceLease) {
        lease.release();
    }

    /// Sweep every pool for idle instances. Returns the number removed.
    pub fn reap_idle(&self) -> usize {
        let pools: Vec<Arc<ModelPool>> = read(&self.pools).values().cloned().collect();
        let removed: usize = pools.iter().map(|pool| pool.reap_idle()).sum();
        if removed > 0 {
            info!(removed, "idle sweep removed model instances");
        }
        removed
    }

    /// Start a background task calling [`reap_idle`](Self::reap_idle) every `interval`.
    ///
    /// The task holds only a weak reference and exits once the manager is
    /// dropped. Dropping the returned handle stops it as well.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> ReaperHandle {
        let manager: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.reap_idle();
            }
            debug!("idle reaper stopped");
        });
        ReaperHandle { task }
    }

    /// Drop every pool. Instances still leased are unloaded once returned.
    pub fn clear(&self) {
        let drained: Vec<Arc<ModelPool>> = {
            let mut pools = write(&self.pools);
            pools.drain().map(|(_, pool)| pool).collect()
        };
        info!(pools = drained.len(), "cleared model pools");
    }

    /// Paths with a pool, sorted.
    pub fn model_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = read(&self.pools).keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn stats(&self) -> ManagerStats {
        let pools: Vec<Arc<ModelPool>> = read(&self.pools).values().cloned().collect();

        let mut stats = ManagerStats::default();
        let summary = &mut stats.summary;
        for pool in pools {
            let pool_stats = pool.stats();
            summary.total_pools += 1;
            summary.total_instances += pool_stats.total_instances;
            summary.total_requests += pool_stats.total_requests;
            summary.total_cache_hits += pool_stats.cache_hits;
            stats.pools.insert(pool_stats.model_path.clone(), pool_stats);
        }
        summary.overall_cache_hit_rate = percent(summary.total_cache_hits, summary.total_requests);
        stats
    }
}

/// Handle to the background idle reaper. Aborts the task on drop.
#[derive(Debug)]
pub struct ReaperHandle {
    task: JoinHandle<()>,
}

impl ReaperHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
