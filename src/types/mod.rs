//! Public types for the Mimir API.

mod generate;
mod params;
mod response;
mod stats;

pub use generate::{GenerateEvent, GenerateRequest, GenerationResult};
pub use params::{LoadParams, LoadProfile, SamplingConfig, SamplingParams};
pub use response::{Completion, FinishReason, Usage};
pub(crate) use stats::percent;
pub use stats::{
    CacheStats, GenerationStats, InstanceStats, ManagerStats, ModelUsage, PoolStats, PoolSummary,
    QueueStats, ServiceStats,
};
