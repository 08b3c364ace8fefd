//! The inference black box.
//!
//! Mimir never runs a model itself. A [`ModelBackend`] (llama.cpp bindings,
//! candle, an ONNX session, ...) provides loading and inference; everything
//! in this crate decides *when* to call it and with what.
//!
//! All methods are blocking and are invoked from
//! `tokio::task::spawn_blocking`, so implementations are free to run for a
//! long time without stalling the async runtime.
//!
//! # Example
//!
//! ```ignore
//! impl ModelBackend for LlamaBackend {
//!     fn name(&self) -> &str { "llama.cpp" }
//!
//!     fn load(&self, path: &Path, profile: &LoadProfile) -> Result<ModelHandle, LoadError> {
//!         let model = LlamaModel::open(path, profile.n_ctx, profile.n_gpu_layers)
//!             .map_err(|e| LoadError::new(e.to_string()))?;
//!         Ok(ModelHandle::new(model))
//!     }
//!
//!     fn infer(&self, model: &ModelHandle, prompt: &str, sampling: &SamplingConfig) -> Result<Completion> {
//!         let model = model.downcast_ref::<LlamaModel>().ok_or(...)?;
//!         // ... run the model
//!     }
//! }
//! ```

use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::Result;
use crate::error::LoadError;
use crate::types::{Completion, LoadProfile, SamplingConfig};

/// Opaque handle to a loaded model.
///
/// Cloning is cheap and shares the underlying model.
#[derive(Clone)]
pub struct ModelHandle(Arc<dyn Any + Send + Sync>);

impl ModelHandle {
    pub fn new<T: Any + Send + Sync>(model: T) -> Self {
        Self(Arc::new(model))
    }

    /// Borrow the backend's concrete model type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Whether both handles refer to the same loaded model.
    pub fn ptr_eq(&self, other: &ModelHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("refs", &Arc::strong_count(&self.0))
            .finish()
    }
}

/// Capability interface for loading and running models.
pub trait ModelBackend: Send + Sync {
    /// Backend name for logging/debugging.
    fn name(&self) -> &str;

    /// Size of the model file in bytes, used to pick tiered load defaults.
    fn model_size(&self, path: &Path) -> std::io::Result<u64> {
        std::fs::metadata(path).map(|m| m.len())
    }

    /// Load a model with fully resolved parameters.
    ///
    /// May fail for malformed files or insufficient memory. The caller
    /// decides whether to retry with safer parameters.
    fn load(&self, path: &Path, profile: &LoadProfile) -> std::result::Result<ModelHandle, LoadError>;

    /// Run inference to completion.
    fn infer(&self, model: &ModelHandle, prompt: &str, sampling: &SamplingConfig)
    -> Result<Completion>;

    /// Run inference, reporting each generated chunk to `on_token`.
    ///
    /// `on_token` returns `false` when the consumer is gone; implementations
    /// should stop generating early in that case. The default implementation
    /// runs [`infer`](Self::infer) and reports the whole text as one chunk.
    fn infer_streaming(
        &self,
        model: &ModelHandle,
        prompt: &str,
        sampling: &SamplingConfig,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<Completion> {
        let completion = self.infer(model, prompt, sampling)?;
        on_token(&completion.text);
        Ok(completion)
    }

    /// Release resources held by a model that is being evicted.
    ///
    /// Other clones of the handle may still exist; the default does nothing
    /// and lets the last clone drop the model.
    fn unload(&self, _model: &ModelHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_downcasts_to_concrete_type() {
        let handle = ModelHandle::new(String::from("weights"));
        assert_eq!(handle.downcast_ref::<String>().map(String::as_str), Some("weights"));
        assert!(handle.downcast_ref::<u32>().is_none());
    }

    #[test]
    fn clones_share_the_model() {
        let a = ModelHandle::new(1u8);
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&ModelHandle::new(1u8)));
    }
}
