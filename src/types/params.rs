//! Model load parameters and sampling parameters.
//!
//! Two layers exist for each concern: a caller-facing struct where every
//! field is optional ([`LoadParams`], [`SamplingParams`]) and a resolved
//! struct with concrete values that is handed to the backend
//! ([`LoadProfile`], [`SamplingConfig`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Caller overrides for loading a model.
///
/// Unset fields are filled in by the
/// [`TieringPolicy`](crate::backend::TieringPolicy) based on file size.
/// `extra` carries backend-specific keys the typed fields do not cover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadParams {
    /// Layers offloaded to the accelerator (-1 = all).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_gpu_layers: Option<i32>,

    /// Context window in tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_ctx: Option<u32>,

    /// Prompt processing batch size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_batch: Option<u32>,

    /// CPU threads used for inference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_threads: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_mmap: Option<bool>,

    /// Lock model memory so it cannot be swapped out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_mlock: Option<bool>,

    /// Half-precision key/value cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub f16_kv: Option<bool>,

    /// Backend-specific parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl LoadParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_gpu_layers(mut self, layers: i32) -> Self {
        self.n_gpu_layers = Some(layers);
        self
    }

    pub fn n_ctx(mut self, n_ctx: u32) -> Self {
        self.n_ctx = Some(n_ctx);
        self
    }

    pub fn n_batch(mut self, n_batch: u32) -> Self {
        self.n_batch = Some(n_batch);
        self
    }

    pub fn n_threads(mut self, n_threads: u32) -> Self {
        self.n_threads = Some(n_threads);
        self
    }

    pub fn use_mmap(mut self, enabled: bool) -> Self {
        self.use_mmap = Some(enabled);
        self
    }

    pub fn use_mlock(mut self, enabled: bool) -> Self {
        self.use_mlock = Some(enabled);
        self
    }

    pub fn f16_kv(mut self, enabled: bool) -> Self {
        self.f16_kv = Some(enabled);
        self
    }

    /// Add a backend-specific parameter.
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Every set parameter as a `(key, value)` pair, sorted by key.
    pub fn sorted_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: BTreeMap<String, String> = self.extra.clone();
        let typed = [
            ("n_gpu_layers", self.n_gpu_layers.map(|v| v.to_string())),
            ("n_ctx", self.n_ctx.map(|v| v.to_string())),
            ("n_batch", self.n_batch.map(|v| v.to_string())),
            ("n_threads", self.n_threads.map(|v| v.to_string())),
            ("use_mmap", self.use_mmap.map(|v| v.to_string())),
            ("use_mlock", self.use_mlock.map(|v| v.to_string())),
            ("f16_kv", self.f16_kv.map(|v| v.to_string())),
        ];
        for (key, value) in typed {
            if let Some(value) = value {
                pairs.insert(key.to_string(), value);
            }
        }
        pairs.into_iter().collect()
    }
}

/// Fully resolved load configuration handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadProfile {
    pub n_gpu_layers: i32,
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_threads: u32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub f16_kv: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl LoadProfile {
    /// Overlay caller overrides on top of this profile.
    pub fn with_overrides(mut self, overrides: &LoadParams) -> Self {
        if let Some(v) = overrides.n_gpu_layers {
            self.n_gpu_layers = v;
        }
        if let Some(v) = overrides.n_ctx {
            self.n_ctx = v;
        }
        if let Some(v) = overrides.n_batch {
            self.n_batch = v;
        }
        if let Some(v) = overrides.n_threads {
            self.n_threads = v;
        }
        if let Some(v) = overrides.use_mmap {
            self.use_mmap = v;
        }
        if let Some(v) = overrides.use_mlock {
            self.use_mlock = v;
        }
        if let Some(v) = overrides.f16_kv {
            self.f16_kv = v;
        }
        self.extra
            .extend(overrides.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

// Sampling bounds. Out-of-range values are clamped, never rejected.
const MAX_TOKENS_DEFAULT: u32 = 200;
const MAX_TOKENS_CAP: u32 = 1000;
const TEMPERATURE_DEFAULT: f32 = 0.7;
const TEMPERATURE_RANGE: (f32, f32) = (0.1, 2.0);
const TOP_P_DEFAULT: f32 = 0.9;
const TOP_P_RANGE: (f32, f32) = (0.1, 1.0);
const TOP_K_DEFAULT: u32 = 40;
const TOP_K_RANGE: (u32, u32) = (1, 100);
const REPEAT_PENALTY_DEFAULT: f32 = 1.1;
const REPEAT_PENALTY_RANGE: (f32, f32) = (1.0, 1.5);
const DEFAULT_STOP: [&str; 4] = ["</s>", "\n\nQuestion:", "\n\nHuman:", "\n\n"];

/// Caller-supplied sampling parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    /// Stop sequences. `None` selects the default set; an empty list disables stops.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl SamplingParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn repeat_penalty(mut self, penalty: f32) -> Self {
        self.repeat_penalty = Some(penalty);
        self
    }

    pub fn stop(mut self, stop: Vec<String>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Resolve into concrete values, clamping anything unsafe into range.
    pub fn sanitize(&self) -> SamplingConfig {
        SamplingConfig {
            max_tokens: self
                .max_tokens
                .unwrap_or(MAX_TOKENS_DEFAULT)
                .clamp(1, MAX_TOKENS_CAP),
            temperature: clamp_f32(self.temperature, TEMPERATURE_DEFAULT, TEMPERATURE_RANGE),
            top_p: clamp_f32(self.top_p, TOP_P_DEFAULT, TOP_P_RANGE),
            top_k: self
                .top_k
                .unwrap_or(TOP_K_DEFAULT)
                .clamp(TOP_K_RANGE.0, TOP_K_RANGE.1),
            repeat_penalty: clamp_f32(
                self.repeat_penalty,
                REPEAT_PENALTY_DEFAULT,
                REPEAT_PENALTY_RANGE,
            ),
            stop: self
                .stop
                .clone()
                .unwrap_or_else(|| DEFAULT_STOP.iter().map(|s| s.to_string()).collect()),
        }
    }
}

fn clamp_f32(value: Option<f32>, default: f32, (min, max): (f32, f32)) -> f32 {
    match value {
        Some(v) if v.is_finite() => v.clamp(min, max),
        _ => default,
    }
}

/// Sanitized sampling configuration handed to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub stop: Vec<String>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingParams::default().sanitize()
    }
}
