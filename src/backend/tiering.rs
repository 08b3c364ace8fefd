//! Size-tiered default load parameters.
//!
//! Larger model files get progressively more conservative settings (fewer
//! offloaded layers, smaller context and batch, no memory lock) so a first
//! load attempt is unlikely to run out of memory. A fixed minimal profile is
//! used for the one retry after a failed load.

use std::collections::BTreeMap;

use crate::types::LoadProfile;

const GIB: u64 = 1024 * 1024 * 1024;

/// Strategy for choosing load parameters from a model's file size.
pub trait TieringPolicy: Send + Sync {
    /// Default profile for a model file of `file_size` bytes.
    fn profile_for(&self, file_size: u64) -> LoadProfile;

    /// Minimal profile used for the single retry after a failed load.
    fn fallback_profile(&self) -> LoadProfile;
}

/// Size class of a model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Small,
    Medium,
    Large,
}

/// Three-tier policy keyed on file size.
#[derive(Debug, Clone)]
pub struct SizeTieredPolicy {
    /// Files strictly larger than this are at least `Medium`. Default: 5 GiB.
    pub medium_threshold: u64,
    /// Files strictly larger than this are `Large`. Default: 10 GiB.
    pub large_threshold: u64,
}

impl Default for SizeTieredPolicy {
    fn default() -> Self {
        Self {
            medium_threshold: 5 * GIB,
            large_threshold: 10 * GIB,
        }
    }
}

impl SizeTieredPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn medium_threshold(mut self, bytes: u64) -> Self {
        self.medium_threshold = bytes;
        self
    }

    pub fn large_threshold(mut self, bytes: u64) -> Self {
        self.large_threshold = bytes;
        self
    }

    pub fn tier_for(&self, file_size: u64) -> Tier {
        if file_size > self.large_threshold {
            Tier::Large
        } else if file_size > self.medium_threshold {
            Tier::Medium
        } else {
            Tier::Small
        }
    }
}

impl TieringPolicy for SizeTieredPolicy {
    fn profile_for(&self, file_size: u64) -> LoadProfile {
        match self.tier_for(file_size) {
            // CPU only; locking >10 GiB of pages is what usually kills the host
            Tier::Large => LoadProfile {
                n_gpu_layers: 0,
                n_ctx: 2048,
                n_batch: 256,
                n_threads: 6,
                use_mmap: true,
                use_mlock: false,
                f16_kv: true,
                extra: BTreeMap::new(),
            },
            Tier::Medium => LoadProfile {
                n_gpu_layers: 10,
                n_ctx: 3072,
                n_batch: 384,
                n_threads: 8,
                use_mmap: true,
                use_mlock: true,
                f16_kv: true,
                extra: BTreeMap::new(),
            },
            Tier::Small => LoadProfile {
                n_gpu_layers: -1,
                n_ctx: 4096,
                n_batch: 512,
                n_threads: 8,
                use_mmap: true,
                use_mlock: true,
                f16_kv: true,
                extra: BTreeMap::new(),
            },
        }
    }

    fn fallback_profile(&self) -> LoadProfile {
        LoadProfile {
            n_gpu_layers: 0,
            n_ctx: 1024,
            n_batch: 128,
            n_threads: 4,
            use_mmap: true,
            use_mlock: false,
            f16_kv: false,
            extra: BTreeMap::new(),
        }
    }
}
