//! Mimir error types

use std::time::Duration;

use serde::Serialize;

use crate::queue::TaskId;

/// Failure reported by a [`ModelBackend`](crate::backend::ModelBackend) while
/// loading a model file.
///
/// Kept separate from [`MimirError`] so the [`Loader`](crate::backend::Loader)
/// can decide on the safe-parameter retry before anything crosses a
/// component boundary.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct LoadError {
    message: String,
}

impl LoadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Mimir error types
#[derive(Debug, thiserror::Error)]
pub enum MimirError {
    // Admission errors
    #[error("admission queue full, gave up after {waited:?}")]
    QueueFull { waited: Duration },

    #[error("admission queue is shutting down")]
    ShuttingDown,

    #[error("stopped waiting for task {task_id} after {waited:?}")]
    ResultTimeout { task_id: TaskId, waited: Duration },

    #[error("task {task_id} failed: {message}")]
    TaskFailed { task_id: TaskId, message: String },

    #[error("task {task_id} exceeded its execution timeout of {timeout:?}")]
    TaskTimedOut { task_id: TaskId, timeout: Duration },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    // Instance management errors
    #[error("no model instance available for {path} within {waited:?}")]
    AcquireTimeout { path: String, waited: Duration },

    /// Model failed to load even after the safe-parameter retry.
    #[error("failed to load model {path}: {source}")]
    LoaderFailure {
        path: String,
        #[source]
        source: LoadError,
    },

    #[error("model file not found: {0}")]
    ModelNotFound(String),

    // Inference errors
    #[error("inference failed: {0}")]
    InferenceFailure(String),

    #[error("inference timed out after {0:?}")]
    InferenceTimeout(Duration),

    // Input / configuration errors
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

/// User-visible failure classes reported in a
/// [`GenerationResult`](crate::types::GenerationResult).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AcquireTimeout,
    QueueFull,
    ResultTimeout,
    LoaderFailure,
    InferenceFailure,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcquireTimeout => "acquire_timeout",
            Self::QueueFull => "queue_full",
            Self::ResultTimeout => "result_timeout",
            Self::LoaderFailure => "loader_failure",
            Self::InferenceFailure => "inference_failure",
            Self::Other => "other",
        }
    }
}

impl MimirError {
    /// Collapse this error onto one of the user-visible failure classes.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::AcquireTimeout { .. } => FailureKind::AcquireTimeout,
            Self::QueueFull { .. } | Self::ShuttingDown => FailureKind::QueueFull,
            Self::ResultTimeout { .. } | Self::TaskNotFound(_) => FailureKind::ResultTimeout,
            Self::LoaderFailure { .. } | Self::ModelNotFound(_) => FailureKind::LoaderFailure,
            Self::InferenceFailure(_)
            | Self::InferenceTimeout(_)
            | Self::TaskFailed { .. }
            | Self::TaskTimedOut { .. } => FailureKind::InferenceFailure,
            Self::InvalidInput(_) | Self::Configuration(_) => FailureKind::Other,
        }
    }

    /// Whether the caller may simply retry the same request later.
    ///
    /// Loader and inference failures are fatal for the request that hit them.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AcquireTimeout { .. }
                | Self::QueueFull { .. }
                | Self::ShuttingDown
                | Self::ResultTimeout { .. }
        )
    }
}

/// Result type alias for Mimir operations
pub type Result<T> = std::result::Result<T, MimirError>;
