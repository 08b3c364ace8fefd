//! A loaded model plus its usage bookkeeping.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::ConfigFingerprint;
use crate::backend::ModelHandle;

/// One loaded model inside a [`ModelPool`](super::ModelPool).
///
/// The busy flag is the only signal for exclusive use. It is flipped only
/// while the owning pool's lock is held, so claim-and-mark is atomic.
#[derive(Debug)]
pub struct ModelInstance {
    id: u64,
    handle: ModelHandle,
    model_path: PathBuf,
    fingerprint: ConfigFingerprint,
    created_at: Instant,
    last_used: Instant,
    usage_count: u64,
    busy: bool,
}

impl ModelInstance {
    /// A freshly loaded instance, already claimed by the request that loaded it.
    pub(crate) fn new_claimed(
        id: u64,
        handle: ModelHandle,
        model_path: PathBuf,
        fingerprint: ConfigFingerprint,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle,
            model_path,
            fingerprint,
            created_at: now,
            last_used: now,
            usage_count: 1,
            busy: true,
        }
    }

    /// Claim an idle instance whose fingerprint matches.
    ///
    /// Returns `false` (and changes nothing) if the instance is busy or
    /// configured differently.
    pub(crate) fn try_claim(&mut self, fingerprint: ConfigFingerprint) -> bool {
        if self.busy || self.fingerprint != fingerprint {
            return false;
        }
        self.busy = true;
        self.mark_used();
        true
    }

    /// Clear the busy flag. Returns `false` if the instance was already idle.
    pub(crate) fn release(&mut self) -> bool {
        if !self.busy {
            return false;
        }
        self.busy = false;
        self.last_used = Instant::now();
        true
    }

    fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.usage_count += 1;
    }

    /// Idle for strictly longer than `max_idle` as of `now`. Busy instances never are.
    pub(crate) fn idle_longer_than(&self, max_idle: Duration, now: Instant) -> bool {
        !self.busy && now.saturating_duration_since(self.last_used) > max_idle
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn fingerprint(&self) -> ConfigFingerprint {
        self.fingerprint
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LoadParams;

    fn instance(params: &LoadParams) -> ModelInstance {
        ModelInstance::new_claimed(
            1,
            ModelHandle::new(()),
            PathBuf::from("/m.gguf"),
            ConfigFingerprint::of(params),
        )
    }

    #[test]
    fn new_instance_is_busy() {
        let inst = instance(&LoadParams::new());
        assert!(inst.is_busy());
        assert_eq!(inst.usage_count(), 1);
    }

    #[test]
    fn busy_instance_cannot_be_claimed() {
        let params = LoadParams::new();
        let mut inst = instance(&params);
        assert!(!inst.try_claim(ConfigFingerprint::of(&params)));
    }

    #[test]
    fn release_is_single_shot() {
        let mut inst = instance(&LoadParams::new());
        assert!(inst.release());
        assert!(!inst.release());
        assert!(!inst.is_busy());
    }

    #[test]
    fn claim_requires_matching_fingerprint() {
        let params = LoadParams::new();
        let mut inst = instance(&params);
        inst.release();
        assert!(!inst.try_claim(ConfigFingerprint::of(&LoadParams::new().n_ctx(1))));
        assert!(inst.try_claim(ConfigFingerprint::of(&params)));
        assert_eq!(inst.usage_count(), 2);
    }

    #[test]
    fn idle_check_skips_busy_instances() {
        let mut inst = instance(&LoadParams::new());
        let later = Instant::now() + Duration::from_secs(10);
        assert!(!inst.idle_longer_than(Duration::from_secs(1), later));
        inst.release();
        assert!(inst.idle_longer_than(Duration::from_secs(1), later));
        assert!(!inst.idle_longer_than(Duration::from_secs(60), later));
    }
}
