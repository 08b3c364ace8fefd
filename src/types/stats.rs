//! Statistics snapshots.
//!
//! All of these are observational copies taken under the owning component's
//! lock; nothing in the crate makes control-flow decisions from them.

use std::collections::BTreeMap;

use serde::Serialize;

/// Hit rate as a percentage, safe for zero totals.
pub(crate) fn percent(hits: u64, total: u64) -> f64 {
    hits as f64 / total.max(1) as f64 * 100.0
}

/// Snapshot of one per-path [`ModelPool`](crate::model::ModelPool).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub model_path: String,
    pub total_instances: usize,
    pub busy_instances: usize,
    pub available_instances: usize,
    /// Slots reserved by loads still in progress.
    pub loading_instances: usize,
    pub max_instances: usize,
    pub total_requests: u64,
    pub cache_hits: u64,
    /// Percentage of successful acquisitions served by an existing instance.
    pub cache_hit_rate: f64,
}

/// Totals across every pool owned by a manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolSummary {
    pub total_pools: usize,
    pub total_instances: usize,
    pub total_requests: u64,
    pub total_cache_hits: u64,
    pub overall_cache_hit_rate: f64,
}

/// Snapshot of a [`ModelPoolManager`](crate::model::ModelPoolManager).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerStats {
    pub pools: BTreeMap<String, PoolStats>,
    pub summary: PoolSummary,
}

/// Usage of one resident model in the LRU cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelUsage {
    pub usage_count: u64,
    pub last_used_secs_ago: f64,
}

/// Snapshot of an [`LruModelCache`](crate::model::LruModelCache).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_models: usize,
    pub max_models: usize,
    pub model_paths: Vec<String>,
    pub usage_stats: BTreeMap<String, ModelUsage>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

/// Statistics of whichever instance strategy the service runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum InstanceStats {
    Lru(CacheStats),
    Pooled(ManagerStats),
}

impl InstanceStats {
    /// Number of model instances currently resident.
    pub fn resident_instances(&self) -> usize {
        match self {
            Self::Lru(stats) => stats.total_models,
            Self::Pooled(stats) => stats.summary.total_instances,
        }
    }
}

/// Counters of an [`AdmissionQueue`](crate::queue::AdmissionQueue).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total_requests: u64,
    pub completed_requests: u64,
    /// Includes rejected submissions and timed-out tasks.
    pub failed_requests: u64,
    pub timed_out_requests: u64,
    pub queued_requests: u64,
    pub active_requests: u64,
    /// Units currently buffered in the bounded channel.
    pub queue_size: usize,
    pub max_concurrent: usize,
    pub max_workers: usize,
    pub running: bool,
}

/// Request counters of the [`GenerationService`](crate::service::GenerationService).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub concurrent_requests: u64,
    pub avg_processing_time_ms: f64,
    pub total_tokens_generated: u64,
    #[serde(skip)]
    pub(crate) total_processing_ms: f64,
}

impl GenerationStats {
    pub(crate) fn begin(&mut self) {
        self.total_requests += 1;
        self.concurrent_requests += 1;
    }

    pub(crate) fn finish(&mut self, processing_ms: f64, tokens: u64, success: bool) {
        self.concurrent_requests = self.concurrent_requests.saturating_sub(1);
        if success {
            self.successful_requests += 1;
            self.total_tokens_generated += tokens;
        } else {
            self.failed_requests += 1;
        }
        self.total_processing_ms += processing_ms;
        let completed = self.successful_requests + self.failed_requests;
        self.avg_processing_time_ms = self.total_processing_ms / completed as f64;
    }

    /// Start over, carrying requests that are still in flight.
    pub(crate) fn reset(&mut self) {
        let in_flight = self.concurrent_requests;
        *self = Self {
            total_requests: in_flight,
            concurrent_requests: in_flight,
            ..Self::default()
        };
    }

    /// Generated tokens per second of wall time spent in requests.
    pub fn tokens_per_second(&self) -> f64 {
        if self.total_processing_ms > 0.0 {
            self.total_tokens_generated as f64 / (self.total_processing_ms / 1000.0)
        } else {
            0.0
        }
    }

    /// Fraction (0.0..=1.0) of requests that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests > 0 {
            self.successful_requests as f64 / self.total_requests as f64
        } else {
            0.0
        }
    }
}

/// Aggregate statistics of the generation service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStats {
    pub generation: GenerationStats,
    pub instances: InstanceStats,
    pub warmup_complete: bool,
    pub avg_tokens_per_second: f64,
    pub success_rate: f64,
}
