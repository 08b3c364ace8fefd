//! Model loading with a single safe-parameter retry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use super::{ModelBackend, ModelHandle, SizeTieredPolicy, TieringPolicy};
use crate::error::LoadError;
use crate::telemetry;
use crate::types::LoadParams;
use crate::{MimirError, Result};

/// Resolves load parameters and drives the backend's `load`.
///
/// The first attempt uses the tier profile for the file size with the
/// caller's overrides on top. If that fails, exactly one more attempt is made
/// with the policy's fallback profile; a second failure is a
/// [`MimirError::LoaderFailure`].
pub struct Loader {
    backend: Arc<dyn ModelBackend>,
    policy: Arc<dyn TieringPolicy>,
}

impl Loader {
    pub fn new(backend: Arc<dyn ModelBackend>, policy: Arc<dyn TieringPolicy>) -> Self {
        Self { backend, policy }
    }

    /// Loader with the default [`SizeTieredPolicy`].
    pub fn with_default_policy(backend: Arc<dyn ModelBackend>) -> Self {
        Self::new(backend, Arc::new(SizeTieredPolicy::default()))
    }

    pub fn backend(&self) -> &Arc<dyn ModelBackend> {
        &self.backend
    }

    /// Load a model, blocking the current thread.
    pub fn load(&self, path: &Path, overrides: &LoadParams) -> Result<ModelHandle> {
        let file_size = self
            .backend
            .model_size(path)
            .map_err(|e| MimirError::ModelNotFound(format!("{}: {e}", path.display())))?;
        let profile = self.policy.profile_for(file_size).with_overrides(overrides);

        info!(
            backend = self.backend.name(),
            path = %path.display(),
            size_gb = file_size as f64 / (1024.0 * 1024.0 * 1024.0),
            n_gpu_layers = profile.n_gpu_layers,
            n_ctx = profile.n_ctx,
            "loading model"
        );

        let first = match self.backend.load(path, &profile) {
            Ok(handle) => {
                metrics::counter!(telemetry::MODEL_LOADS_TOTAL, "outcome" => "ok").increment(1);
                return Ok(handle);
            }
            Err(e) => e,
        };

        warn!(path = %path.display(), error = %first, "model load failed, retrying with safe parameters");
        let fallback = self.policy.fallback_profile();
        match self.backend.load(path, &fallback) {
            Ok(handle) => {
                metrics::counter!(telemetry::MODEL_LOADS_TOTAL, "outcome" => "fallback")
                    .increment(1);
                Ok(handle)
            }
            Err(second) => {
                metrics::counter!(telemetry::MODEL_LOADS_TOTAL, "outcome" => "error").increment(1);
                error!(path = %path.display(), error = %second, "model load failed with safe parameters");
                Err(MimirError::LoaderFailure {
                    path: path.display().to_string(),
                    source: second,
                })
            }
        }
    }

    /// Load a model on the blocking thread pool.
    pub async fn load_blocking(
        self: &Arc<Self>,
        path: PathBuf,
        overrides: LoadParams,
    ) -> Result<ModelHandle> {
        let loader = Arc::clone(self);
        let display = path.display().to_string();
        tokio::task::spawn_blocking(move || loader.load(&path, &overrides))
            .await
            .unwrap_or_else(|e| {
                Err(MimirError::LoaderFailure {
                    path: display,
                    source: LoadError::new(format!("loader task did not complete: {e}")),
                })
            })
    }

    /// Hand an evicted model back to the backend.
    pub fn unload(&self, handle: &ModelHandle) {
        self.backend.unload(handle);
    }
}
