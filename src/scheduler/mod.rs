//! Bounded-concurrency, priority-ordered task execution.
//!
//! See [`TaskScheduler`] for the contract: fixed worker count, HIGH before
//! LOW with FIFO within a band, and exactly-once completion of every
//! submitted task.

mod pool;
mod queue;

use thiserror::Error;

pub use pool::{TaskHandle, TaskScheduler};
pub use queue::{QueuedTask, TaskPriority, TaskQueue};

/// Terminal outcome of a task that did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task ran and failed (after any task-internal retries).
    #[error("task failed: {0}")]
    Failed(String),

    /// The task panicked; the payload message is preserved.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was cancelled before it started.
    #[error("task cancelled")]
    Cancelled,
}

impl TaskError {
    /// Convenience constructor for [`TaskError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}
