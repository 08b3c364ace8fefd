//! Per-path pool of model instances.
//!
//! A [`ModelPool`] holds up to `max_instances` loaded copies of one model
//! file, each possibly loaded with different parameters. A request is served
//! by an idle instance with a matching [`ConfigFingerprint`]; failing that a
//! new instance is loaded if the pool has room; failing that the request
//! polls until an instance frees up or its timeout expires.
//!
//! Waiting is bounded polling with a fixed interval rather than a wake-up
//! notification, so a waiter observes a freed instance up to one interval
//! late but never waits past `timeout + poll_interval`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{ConfigFingerprint, ModelInstance};
use crate::backend::{Loader, ModelHandle};
use crate::sync::lock;
use crate::telemetry;
use crate::types::{LoadParams, PoolStats, percent};
use crate::{MimirError, Result};

/// Configuration for a [`ModelPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum instances of one model path. Default: 3.
    pub max_instances: usize,
    /// Idle instances older than this are removed by the reaper. Default: 300s.
    pub max_idle: Duration,
    /// Interval between availability checks while waiting. Default: 100ms.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 3,
            max_idle: Duration::from_secs(300),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_instances(mut self, n: usize) -> Self {
        self.max_instances = n;
        self
    }

    pub fn max_idle(mut self, idle: Duration) -> Self {
        self.max_idle = idle;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, Default)]
struct PoolState {
    instances: Vec<ModelInstance>,
    /// Slots reserved by loads in flight; counted against the cap.
    loading: usize,
    /// Instances removed while still leased; unloaded when the lease ends.
    retired: HashSet<u64>,
    next_id: u64,
    total_requests: u64,
    cache_hits: u64,
}

enum Claim {
    Reused(InstanceLease),
    Reserved(SlotReservation),
    Saturated,
}

/// Thread-safe pool of instances of a single model file.
pub struct ModelPool {
    model_path: PathBuf,
    loader: Arc<Loader>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for ModelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelPool")
            .field("model_path", &self.model_path)
            .field("max_instances", &self.config.max_instances)
            .finish()
    }
}

impl ModelPool {
    pub fn new(model_path: impl Into<PathBuf>, loader: Arc<Loader>, config: PoolConfig) -> Self {
        Self {
            model_path: model_path.into(),
            loader,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquire an instance loaded with `params`, waiting up to `timeout`.
    ///
    /// Load failures are returned immediately and are not retried here (the
    /// [`Loader`] has already made its one fallback attempt). A saturated
    /// pool yields [`MimirError::AcquireTimeout`].
    pub async fn acquire(
        self: &Arc<Self>,
        params: &LoadParams,
        timeout: Duration,
    ) -> Result<InstanceLease> {
        let fingerprint = ConfigFingerprint::of(params);
        let started = tokio::time::Instant::now();

        loop {
            match self.try_claim(fingerprint) {
                Claim::Reused(lease) => {
                    metrics::counter!(telemetry::INSTANCE_ACQUIRE_TOTAL, "outcome" => "hit")
                        .increment(1);
                    debug!(path = %self.model_path.display(), instance = lease.id(), "reusing model instance");
                    return Ok(lease);
                }
                Claim::Reserved(reservation) => {
                    return self.create(reservation, fingerprint, params).await;
                }
                Claim::Saturated => {}
            }

            let waited = started.elapsed();
            if waited >= timeout {
                metrics::counter!(telemetry::INSTANCE_ACQUIRE_TOTAL, "outcome" => "timeout")
                    .increment(1);
                warn!(path = %self.model_path.display(), waited_ms = waited.as_millis() as u64, "timed out waiting for model instance");
                return Err(MimirError::AcquireTimeout {
                    path: self.model_path.display().to_string(),
                    waited,
                });
            }
            tokio::time::sleep(self.config.poll_interval.min(timeout - waited)).await;
        }
    }

    /// Return an instance to the pool.
    ///
    /// Equivalent to `lease.release()`; the lease is trusted to belong here.
    pub fn release(&self, lease: InstanceLease) {
        lease.release();
    }

    fn try_claim(self: &Arc<Self>, fingerprint: ConfigFingerprint) -> Claim {
        let mut state = lock(&self.state);

        let reused = state.instances.iter_mut().find_map(|inst| {
            inst.try_claim(fingerprint)
                .then(|| InstanceLease::new(Arc::clone(self), &*inst))
        });
        if let Some(lease) = reused {
            state.total_requests += 1;
            state.cache_hits += 1;
            return Claim::Reused(lease);
        }

        if state.instances.len() + state.loading < self.config.max_instances {
            state.loading += 1;
            return Claim::Reserved(SlotReservation {
                pool: Arc::clone(self),
                armed: true,
            });
        }

        Claim::Saturated
    }

    async fn create(
        self: &Arc<Self>,
        reservation: SlotReservation,
        fingerprint: ConfigFingerprint,
        params: &LoadParams,
    ) -> Result<InstanceLease> {
        let loaded = self
            .loader
            .load_blocking(self.model_path.clone(), params.clone())
            .await;

        let mut state = lock(&self.state);
        reservation.commit(&mut state);

        let handle = match loaded {
            Ok(handle) => handle,
            Err(e) => {
                metrics::counter!(telemetry::INSTANCE_ACQUIRE_TOTAL, "outcome" => "error")
                    .increment(1);
                return Err(e);
            }
        };

        let id = state.next_id;
        state.next_id += 1;
        let instance =
            ModelInstance::new_claimed(id, handle, self.model_path.clone(), fingerprint);
        let lease = InstanceLease::new(Arc::clone(self), &instance);
        state.instances.push(instance);
        state.total_requests += 1;

        metrics::counter!(telemetry::INSTANCE_ACQUIRE_TOTAL, "outcome" => "created").increment(1);
        info!(
            path = %self.model_path.display(),
            instance = id,
            fingerprint = %fingerprint,
            instances = state.instances.len(),
            "created model instance"
        );
        Ok(lease)
    }

    fn release_instance(&self, id: u64, handle: &ModelHandle) {
        let mut state = lock(&self.state);
        if let Some(inst) = state.instances.iter_mut().find(|inst| inst.id() == id) {
            if inst.release() {
                debug!(path = %self.model_path.display(), instance = id, "returned model instance to pool");
            }
            return;
        }

        let retired = state.retired.remove(&id);
        drop(state);
        if retired {
            self.loader.unload(handle);
            info!(path = %self.model_path.display(), instance = id, "unloaded retired model instance");
        } else {
            debug!(path = %self.model_path.display(), instance = id, "released instance is no longer pooled");
        }
    }

    /// Take a leased instance out of the pool before its lease ends.
    ///
    /// The slot is free for a new load at once. The instance itself is
    /// unloaded when the outstanding lease is released, so no other caller
    /// ever sees it. `claim` is the usage count the lease was issued at;
    /// returns `false` if that claim has already ended.
    fn retire_instance(&self, id: u64, claim: u64) -> bool {
        let mut state = lock(&self.state);
        let Some(pos) = state.instances.iter().position(|inst| {
            inst.id() == id && inst.is_busy() && inst.usage_count() == claim
        }) else {
            return false;
        };
        state.instances.remove(pos);
        state.retired.insert(id);
        let remaining = state.instances.len();
        drop(state);

        metrics::counter!(telemetry::MODEL_EVICTIONS_TOTAL, "reason" => "retired").increment(1);
        warn!(
            path = %self.model_path.display(),
            instance = id,
            instances = remaining,
            "retired model instance still held by a stalled call"
        );
        true
    }

    /// Remove idle instances older than `max_idle`, unloading them.
    ///
    /// Returns the number of instances removed.
    pub fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let reaped: Vec<ModelInstance> = {
            let mut state = lock(&self.state);
            let (idle, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut state.instances)
                .into_iter()
                .partition(|inst| inst.idle_longer_than(self.config.max_idle, now));
            state.instances = keep;
            idle
        };

        for instance in &reaped {
            self.loader.unload(instance.handle());
            info!(
                path = %self.model_path.display(),
                instance = instance.id(),
                uses = instance.usage_count(),
                "removed idle model instance"
            );
        }
        if !reaped.is_empty() {
            metrics::counter!(telemetry::MODEL_EVICTIONS_TOTAL, "reason" => "idle")
                .increment(reaped.len() as u64);
        }
        reaped.len()
    }

    /// Number of loaded instances (busy or idle).
    pub fn len(&self) -> usize {
        lock(&self.state).instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.state);
        let busy = state.instances.iter().filter(|i| i.is_busy()).count();
        PoolStats {
            model_path: self.model_path.display().to_string(),
            total_instances: state.instances.len(),
            busy_instances: busy,
            available_instances: state.instances.len() - busy,
            loading_instances: state.loading,
            max_instances: self.config.max_instances,
            total_requests: state.total_requests,
            cache_hits: state.cache_hits,
            cache_hit_rate: percent(state.cache_hits, state.total_requests),
        }
    }
}

impl Drop for ModelPool {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        let count = state.instances.len();
        for instance in state.instances.drain(..) {
            self.loader.unload(instance.handle());
        }
        if count > 0 {
            metrics::counter!(telemetry::MODEL_EVICTIONS_TOTAL, "reason" => "clear")
                .increment(count as u64);
            debug!(path = %self.model_path.display(), count, "unloaded pooled instances");
        }
    }
}

/// A pool slot held by an in-flight load.
///
/// Dropping it without [`commit`](Self::commit) (e.g. the acquiring future
/// was cancelled mid-load) gives the slot back.
struct SlotReservation {
    pool: Arc<ModelPool>,
    armed: bool,
}

impl SlotReservation {
    fn commit(mut self, state: &mut PoolState) {
        state.loading = state.loading.saturating_sub(1);
        self.armed = false;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.armed {
            let mut state = lock(&self.pool.state);
            state.loading = state.loading.saturating_sub(1);
        }
    }
}

/// Exclusive use of one pooled instance.
///
/// The instance stays busy until the lease is released, either explicitly
/// with [`release`](Self::release) or when the lease is dropped. Either way
/// the busy flag is cleared exactly once.
pub struct InstanceLease {
    pool: Arc<ModelPool>,
    id: u64,
    handle: ModelHandle,
    fingerprint: ConfigFingerprint,
    usage_count: u64,
}

impl InstanceLease {
    fn new(pool: Arc<ModelPool>, instance: &ModelInstance) -> Self {
        Self {
            pool,
            id: instance.id(),
            handle: instance.handle().clone(),
            fingerprint: instance.fingerprint(),
            usage_count: instance.usage_count(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    pub fn model_path(&self) -> &Path {
        self.pool.model_path()
    }

    pub fn fingerprint(&self) -> ConfigFingerprint {
        self.fingerprint
    }

    /// Usage count of the instance at the time it was acquired.
    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }

    /// Return the instance to its pool.
    pub fn release(self) {
        drop(self);
    }

    /// A token that can later retire this lease's instance, even after the
    /// lease itself has moved elsewhere.
    pub fn retire_token(&self) -> RetireToken {
        RetireToken {
            pool: Arc::clone(&self.pool),
            id: self.id,
            claim: self.usage_count,
        }
    }
}

impl std::fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLease")
            .field("model_path", &self.pool.model_path)
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.pool.release_instance(self.id, &self.handle);
    }
}

/// Retires the instance behind an outstanding [`InstanceLease`].
///
/// Used when the lease holder is stuck, e.g. in an inference call that has
/// outlived its deadline: the pool frees the slot immediately and the
/// instance is unloaded once the lease is finally dropped.
#[derive(Debug)]
pub struct RetireToken {
    pool: Arc<ModelPool>,
    id: u64,
    claim: u64,
}

impl RetireToken {
    /// Returns `false` if the lease was already released.
    pub fn retire(self) -> bool {
        self.pool.retire_instance(self.id, self.claim)
    }
}
