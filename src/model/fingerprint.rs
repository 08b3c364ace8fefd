//! Configuration fingerprints.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::types::LoadParams;

/// Deterministic hash of a set of load parameters.
///
/// Two parameter sets with the same keys and values always produce the same
/// fingerprint regardless of the order the keys were inserted in. An idle
/// pooled instance is only reused for a request with an equal fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConfigFingerprint(u64);

impl ConfigFingerprint {
    pub fn of(params: &LoadParams) -> Self {
        let mut hasher = DefaultHasher::new();
        for (key, value) in params.sorted_pairs() {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        Self(hasher.finish())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConfigFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
