//! Types for generation requests and their results.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, MimirError};
use crate::types::{Completion, FinishReason, InstanceStats, LoadParams, SamplingParams};

/// A single text-generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Display name of the model, echoed back in the result.
    pub model_name: String,

    /// Model file; identity key for pooling and caching.
    pub model_path: PathBuf,

    /// The user question substituted into the prompt template.
    pub question: String,

    /// Prompt template containing a `{question}` placeholder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    #[serde(default)]
    pub load: LoadParams,

    #[serde(default)]
    pub sampling: SamplingParams,
}

impl GenerateRequest {
    /// Create a request using the file stem of `model_path` as the model name.
    pub fn new(model_path: impl Into<PathBuf>, question: impl Into<String>) -> Self {
        let model_path = model_path.into();
        let model_name = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            model_name,
            model_path,
            question: question.into(),
            template: None,
            load: LoadParams::default(),
            sampling: SamplingParams::default(),
        }
    }

    pub fn model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn load(mut self, load: LoadParams) -> Self {
        self.load = load;
        self
    }

    pub fn sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }
}

/// Events emitted during streaming generation
#[derive(Debug, Clone, PartialEq)]
pub enum GenerateEvent {
    /// Generated text chunk
    Token(String),

    /// Generation complete
    Done {
        finish_reason: FinishReason,
        completion_tokens: u32,
    },
}

/// Uniform outcome of a generation request.
///
/// Every failure mode is reported here rather than as an `Err`, with
/// `success == false`, an `error` message and a [`FailureKind`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub processing_time_ms: u64,
    pub token_count: u32,
    pub total_tokens: u32,
    pub model_used: String,
    pub model_path: PathBuf,
    pub tokens_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_stats: Option<InstanceStats>,
}

impl GenerationResult {
    pub(crate) fn completed(
        request: &GenerateRequest,
        completion: Completion,
        elapsed: Duration,
        pool_stats: InstanceStats,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        let tokens = completion.usage.completion_tokens;
        Self {
            success: true,
            text: Some(completion.text.trim().to_string()),
            error: None,
            failure: None,
            processing_time_ms: elapsed.as_millis() as u64,
            token_count: tokens,
            total_tokens: completion.usage.total_tokens,
            model_used: request.model_name.clone(),
            model_path: request.model_path.clone(),
            tokens_per_second: if secs > 0.0 { tokens as f64 / secs } else { 0.0 },
            pool_stats: Some(pool_stats),
        }
    }

    /// Build a failure result from any crate error.
    pub fn failed(
        model_name: impl Into<String>,
        model_path: impl Into<PathBuf>,
        error: &MimirError,
        elapsed: Duration,
    ) -> Self {
        Self {
            success: false,
            text: None,
            error: Some(error.to_string()),
            failure: Some(error.kind()),
            processing_time_ms: elapsed.as_millis() as u64,
            token_count: 0,
            total_tokens: 0,
            model_used: model_name.into(),
            model_path: model_path.into(),
            tokens_per_second: 0.0,
            pool_stats: None,
        }
    }
}
