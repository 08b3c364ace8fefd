//! Request orchestration on top of the model strategies.

mod generation;
mod prompt;
mod stream;

pub use generation::{
    GenerationService, InstanceStrategy, ServiceConfig, WARMUP_SIZE_LIMIT, WarmupReport,
};
pub use prompt::{DEFAULT_TEMPLATE, build_prompt};
pub use stream::{DEFAULT_STREAM_BUFFER, TokenStream, blocking_stream};
