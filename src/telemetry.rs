//! Telemetry metric name constants.
//!
//! Centralised metric names for mimir operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `mimir_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `strategy`: "lru" or "pooled"
//! - `status`: "success", a failure kind, or a task status
//! - `outcome`: acquisition/load outcome (see each metric)
//! - `reason`: why an instance was evicted or a task rejected (see each metric)

/// Total generation requests handled by the service.
///
/// Labels: `strategy`, `status` ("success" | a failure kind such as
/// "acquire_timeout" or "inference_failure").
pub const GENERATIONS_TOTAL: &str = "mimir_generations_total";

/// Generation duration in seconds, including instance acquisition.
///
/// Labels: `strategy`.
pub const GENERATION_DURATION_SECONDS: &str = "mimir_generation_duration_seconds";

/// Total completion tokens generated.
///
/// Labels: `strategy`.
pub const TOKENS_TOTAL: &str = "mimir_tokens_total";

/// Total instance acquisitions from a model pool.
///
/// Labels: `outcome` ("hit" | "created" | "timeout" | "error").
pub const INSTANCE_ACQUIRE_TOTAL: &str = "mimir_instance_acquire_total";

/// Total LRU cache lookups.
///
/// Labels: `outcome` ("hit" | "miss").
pub const CACHE_LOOKUPS_TOTAL: &str = "mimir_cache_lookups_total";

/// Total model load attempts.
///
/// Labels: `outcome` ("ok" | "fallback" | "error").
pub const MODEL_LOADS_TOTAL: &str = "mimir_model_loads_total";

/// Total model instances removed from memory.
///
/// Labels: `reason` ("lru" | "idle" | "clear" | "retired"). A retired
/// instance is counted when it leaves its pool; the unload follows once its
/// stalled inference call returns.
pub const MODEL_EVICTIONS_TOTAL: &str = "mimir_model_evictions_total";

/// Total admission tasks reaching a terminal state.
///
/// Labels: `status` ("completed" | "failed" | "timed_out" | "abandoned").
pub const QUEUE_TASKS_TOTAL: &str = "mimir_queue_tasks_total";

/// Total submissions rejected by the admission queue.
///
/// Labels: `reason` ("full" | "shutdown").
pub const QUEUE_REJECTIONS_TOTAL: &str = "mimir_queue_rejections_total";
