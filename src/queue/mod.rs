//! Admission control for generation work.

mod admission;
mod task;

pub use admission::{AdmissionQueue, QueueConfig};
pub(crate) use admission::panic_message;
pub use task::{TaskId, TaskSnapshot, TaskStatus};
