//! Diagnostic backend that echoes prompts.
//!
//! Exercises admission, pooling and eviction end to end without model files
//! or an inference library. Used by `mimir bench`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{ModelBackend, ModelHandle};
use crate::error::LoadError;
use crate::types::{Completion, FinishReason, LoadProfile, SamplingConfig};
use crate::{MimirError, Result};

/// The "model" an [`EchoBackend`] loads.
#[derive(Debug, Clone)]
pub struct EchoModel {
    pub path: PathBuf,
    pub profile: LoadProfile,
}

/// Backend that answers with the words of the prompt's last line.
#[derive(Debug, Clone, Default)]
pub struct EchoBackend {
    /// Simulated time spent in each inference call.
    pub latency: Duration,
    /// Simulated load time.
    pub load_latency: Duration,
    /// Reported file size when the path does not exist on disk.
    pub virtual_size: u64,
}

impl EchoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn load_latency(mut self, latency: Duration) -> Self {
        self.load_latency = latency;
        self
    }

    pub fn virtual_size(mut self, bytes: u64) -> Self {
        self.virtual_size = bytes;
        self
    }

    fn words<'a>(prompt: &'a str, max_tokens: u32) -> (Vec<&'a str>, bool) {
        let line = prompt
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("");
        let all: Vec<&str> = line.split_whitespace().collect();
        let limit = max_tokens as usize;
        let truncated = all.len() > limit;
        (all.into_iter().take(limit).collect(), truncated)
    }
}

impl ModelBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    fn model_size(&self, path: &Path) -> std::io::Result<u64> {
        Ok(std::fs::metadata(path)
            .map(|m| m.len())
            .unwrap_or(self.virtual_size))
    }

    fn load(
        &self,
        path: &Path,
        profile: &LoadProfile,
    ) -> std::result::Result<ModelHandle, LoadError> {
        if !self.load_latency.is_zero() {
            std::thread::sleep(self.load_latency);
        }
        Ok(ModelHandle::new(EchoModel {
            path: path.to_path_buf(),
            profile: profile.clone(),
        }))
    }

    fn infer(
        &self,
        model: &ModelHandle,
        prompt: &str,
        sampling: &SamplingConfig,
    ) -> Result<Completion> {
        self.infer_streaming(model, prompt, sampling, &mut |_| true)
    }

    fn infer_streaming(
        &self,
        model: &ModelHandle,
        prompt: &str,
        sampling: &SamplingConfig,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<Completion> {
        if model.downcast_ref::<EchoModel>().is_none() {
            return Err(MimirError::InferenceFailure(
                "handle was not loaded by the echo backend".to_string(),
            ));
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let (words, truncated) = Self::words(prompt, sampling.max_tokens);
        let mut emitted = 0u32;
        for (i, word) in words.iter().enumerate() {
            let chunk = if i == 0 {
                word.to_string()
            } else {
                format!(" {word}")
            };
            emitted += 1;
            if !on_token(&chunk) {
                break;
            }
        }

        let prompt_tokens = prompt.split_whitespace().count() as u32;
        let finish = if truncated {
            FinishReason::Length
        } else {
            FinishReason::Stop
        };
        Ok(Completion::new(words.join(" "), prompt_tokens, emitted).finish_reason(finish))
    }
}
