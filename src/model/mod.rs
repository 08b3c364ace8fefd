//! Model instance management.
//!
//! Two strategies share the same [`Loader`](crate::backend::Loader):
//!
//! - [`LruModelCache`]: one instance per path, at most `max_models` resident,
//!   least recently used evicted first.
//! - [`ModelPoolManager`]: up to `max_instances` instances per path, each
//!   leased exclusively and keyed by a [`ConfigFingerprint`] of its load
//!   parameters.

mod cache;
mod fingerprint;
mod instance;
mod manager;
mod pool;

pub use cache::{CacheConfig, CachedInstance, LruModelCache};
pub use fingerprint::ConfigFingerprint;
pub use instance::ModelInstance;
pub use manager::{ModelPoolManager, ReaperHandle};
pub use pool::{InstanceLease, ModelPool, PoolConfig, RetireToken};
