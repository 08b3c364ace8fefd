//! Token streaming with backpressure.
//!
//! Inference runs on the blocking thread pool and hands each chunk to a
//! bounded `tokio::sync::mpsc` channel with `blocking_send`, so the producer
//! stalls when the consumer falls behind instead of buffering without limit.
//! Dropping the stream closes the channel and the producer stops at its next
//! chunk.

use std::pin::Pin;

use futures_util::Stream;
use tokio_stream::wrappers::ReceiverStream;

use crate::Result;
use crate::types::GenerateEvent;

/// Default number of events buffered between producer and consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// Stream of generation events.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<GenerateEvent>> + Send>>;

/// Run a blocking producer on the blocking pool and expose its output as a
/// bounded stream.
///
/// `produce` gets an `emit` callback; `emit` returns `false` once the
/// consumer has gone away.
///
/// # Panics
///
/// Requires a tokio runtime context.
pub fn blocking_stream<F>(buffer_size: usize, produce: F) -> TokenStream
where
    F: FnOnce(&mut dyn FnMut(Result<GenerateEvent>) -> bool) + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel(buffer_size.max(1));

    tokio::task::spawn_blocking(move || {
        let mut emit = |event: Result<GenerateEvent>| tx.blocking_send(event).is_ok();
        produce(&mut emit);
    });

    Box::pin(ReceiverStream::new(rx))
}
