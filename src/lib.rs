//! Mimir - admission-controlled model pooling for local LLM inference
//!
//! This crate bounds how many model instances are resident and how many
//! generation requests run at once. Requests pass through a bounded
//! admission queue, are served by a reused or freshly loaded model instance
//! (least-recently-used cache or fingerprint-aware per-path pools), and come
//! back as a uniform [`GenerationResult`]. The model itself is an opaque
//! [`ModelBackend`](backend::ModelBackend).
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mimir::backend::EchoBackend;
//! use mimir::{GenerateRequest, Mimir, SamplingParams};
//!
//! #[tokio::main]
//! async fn main() -> mimir::Result<()> {
//!     let engine = Mimir::builder()
//!         .backend(Arc::new(EchoBackend::new()))
//!         .build()?;
//!
//!     let result = engine
//!         .submit_generation(
//!             GenerateRequest::new("/models/llama-7b.gguf", "What is the capital of France?")
//!                 .sampling(SamplingParams::new().max_tokens(64).temperature(0.2)),
//!         )
//!         .await;
//!
//!     match result.text {
//!         Some(text) => println!("{text}"),
//!         None => eprintln!("failed: {:?}", result.error),
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
pub mod service;
mod sync;
pub mod telemetry;
pub mod types;
pub mod version;

// Re-export main types at crate root
pub use engine::{Engine, Mimir, MimirBuilder, StrategyKind};
pub use error::{FailureKind, LoadError, MimirError, Result};
pub use version::{GIT_BRANCH, GIT_SHA, PKG_VERSION, git_dirty, version_string};

// Re-export all types
pub use types::{
    CacheStats, Completion, FinishReason, GenerateEvent, GenerateRequest, GenerationResult,
    GenerationStats, InstanceStats, LoadParams, LoadProfile, ManagerStats, ModelUsage, PoolStats,
    PoolSummary, QueueStats, SamplingConfig, SamplingParams, ServiceStats, Usage,
};
