//! Priority queue for scheduler tasks.
//!
//! Tasks are ordered by priority (HIGH before LOW), then by sequence number
//! (FIFO within the same priority band). This keeps primary collection work
//! ahead of best-effort enrichment without starving either.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use super::TaskError;

/// Execution priority of a scheduler task.
///
/// HIGH is for primary payload fetches; LOW for best-effort secondary work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    /// Best-effort enrichment; runs after all queued HIGH tasks.
    Low,

    /// Primary payload; always pulled before queued LOW tasks.
    High,
}

/// A task waiting in the queue.
///
/// Owned by the scheduler while queued or running; destroyed on completion.
/// The `done` sender is the exactly-once completion channel: it is consumed
/// either by a worker (with the task's result) or by shutdown (with
/// [`TaskError::Cancelled`]), never both.
pub struct QueuedTask<T> {
    /// Label for logging.
    pub label: String,

    /// The work itself.
    pub future: BoxFuture<'static, Result<T, TaskError>>,

    /// Completion channel back to the submitter's handle.
    pub done: oneshot::Sender<Result<T, TaskError>>,

    /// Task priority.
    pub priority: TaskPriority,

    /// Sequence number for FIFO ordering within a priority band.
    sequence: u64,
}

// Custom ordering for the priority queue. BinaryHeap is a max-heap, so the
// FIFO tie-break on sequence numbers is reversed.
impl<T> PartialEq for QueuedTask<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for QueuedTask<T> {}

impl<T> PartialOrd for QueuedTask<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueuedTask<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            // Lower sequence number first within a band; reversed for the
            // max-heap.
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

/// The scheduler's internal priority queue.
///
/// Not thread-safe on its own; the scheduler wraps it in a mutex.
pub struct TaskQueue<T> {
    heap: BinaryHeap<QueuedTask<T>>,
    next_sequence: u64,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        TaskQueue::new()
    }
}

impl<T> TaskQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        TaskQueue {
            heap: BinaryHeap::new(),
            next_sequence: 0,
        }
    }

    /// Returns the number of queued tasks.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if no tasks are queued.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pushes a task, assigning it the next sequence number.
    pub fn push(
        &mut self,
        label: String,
        priority: TaskPriority,
        future: BoxFuture<'static, Result<T, TaskError>>,
        done: oneshot::Sender<Result<T, TaskError>>,
    ) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueuedTask {
            label,
            future,
            done,
            priority,
            sequence,
        });
    }

    /// Pops the highest-priority task, or `None` if the queue is empty.
    pub fn pop(&mut self) -> Option<QueuedTask<T>> {
        self.heap.pop()
    }

    /// Removes and returns every queued task in priority order.
    pub fn drain(&mut self) -> Vec<QueuedTask<T>> {
        let mut tasks = Vec::with_capacity(self.heap.len());
        while let Some(task) = self.pop() {
            tasks.push(task);
        }
        tasks
    }
}
