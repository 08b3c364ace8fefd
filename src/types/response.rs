//! Backend completion types

use serde::{Deserialize, Serialize};

/// Output of a single inference call on a loaded model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
    #[serde(default)]
    pub finish_reason: FinishReason,
}

impl Completion {
    /// Build a completion that stopped naturally.
    pub fn new(text: impl Into<String>, prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            text: text.into(),
            usage: Usage::new(prompt_tokens, completion_tokens),
            finish_reason: FinishReason::Stop,
        }
    }

    pub fn finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = reason;
        self
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Reason the model stopped generating
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
}
