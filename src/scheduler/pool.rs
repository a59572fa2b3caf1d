//! Bounded-concurrency executor pulling tasks in priority order.
//!
//! A single polling cycle's collect phase can fan out into many remote
//! fetches (expanding references found in a primary response, then fetching
//! per-item statistics). Unbounded fan-out would overwhelm the remote device;
//! unscheduled fan-out would starve primary fetches behind best-effort ones.
//! The scheduler decouples "how much work exists" from "how much concurrency
//! is safe", and "what matters first" (HIGH) from "what is enrichment" (LOW).
//!
//! # Completion guarantee
//!
//! A submitted task's handle resolves exactly once, with a result, an error,
//! or [`TaskError::Cancelled`] — success, failure, panic, and shutdown all
//! funnel into the same oneshot channel. The scheduler never retries on the
//! caller's behalf; a task's own transient-error retry (see
//! [`crate::budget::retry_with_backoff`]) happens inside the task future.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::queue::{TaskPriority, TaskQueue};
use super::TaskError;

/// Handle to a submitted task.
///
/// Awaiting [`TaskHandle::join`] suspends the caller until the task completes
/// or is cancelled.
pub struct TaskHandle<T> {
    label: String,
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    /// Returns the label the task was submitted with.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Waits for the task's completion.
    ///
    /// If the scheduler dropped the task without completing it (shutdown
    /// races), this resolves to [`TaskError::Cancelled`] rather than hanging.
    pub async fn join(self) -> Result<T, TaskError> {
        self.rx.await.unwrap_or(Err(TaskError::Cancelled))
    }
}

struct Inner<T> {
    queue: Mutex<TaskQueue<T>>,
    // One permit per queued task; closed on shutdown so workers drain out.
    slots: Semaphore,
    shutdown: CancellationToken,
}

/// Bounded-concurrency, priority-ordered executor for async work items.
///
/// Workers are private to one scheduler instance; each poller engine owns its
/// own scheduler, so there is no cross-poller interference and no global
/// semaphore.
pub struct TaskScheduler<T: Send + 'static> {
    label: String,
    inner: Arc<Inner<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> TaskScheduler<T> {
    /// Creates a scheduler with a fixed number of worker tasks.
    ///
    /// `workers` is clamped to a minimum of 1.
    pub fn new(label: impl Into<String>, workers: usize) -> Self {
        let label = label.into();
        let inner = Arc::new(Inner {
            queue: Mutex::new(TaskQueue::new()),
            slots: Semaphore::new(0),
            shutdown: CancellationToken::new(),
        });

        let worker_count = workers.max(1);
        let handles = (0..worker_count)
            .map(|index| {
                let inner = Arc::clone(&inner);
                let label = label.clone();
                tokio::spawn(worker_loop(inner, label, index))
            })
            .collect();

        debug!(scheduler = %label, workers = worker_count, "Scheduler started");

        TaskScheduler {
            label,
            inner,
            workers: Mutex::new(handles),
        }
    }

    /// Submits a task and returns a handle to await its completion.
    ///
    /// Tasks submitted after [`TaskScheduler::shutdown`] resolve immediately
    /// with [`TaskError::Cancelled`].
    pub fn submit<F>(&self, label: impl Into<String>, priority: TaskPriority, future: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let label = label.into();
        let (tx, rx) = oneshot::channel();

        {
            // The shutdown check happens under the queue lock so it cannot
            // race the shutdown drain: either this task is enqueued before
            // the drain runs, or it observes the cancelled token.
            let mut queue = self.inner.queue.lock().unwrap();
            if self.inner.shutdown.is_cancelled() {
                drop(queue);
                trace!(scheduler = %self.label, task = %label, "Rejecting submit after shutdown");
                let _ = tx.send(Err(TaskError::Cancelled));
                return TaskHandle { label, rx };
            }
            queue.push(label.clone(), priority, Box::pin(future), tx);
        }
        self.inner.slots.add_permits(1);

        trace!(scheduler = %self.label, task = %label, ?priority, "Task queued");
        TaskHandle { label, rx }
    }

    /// Returns the number of tasks queued but not yet started.
    pub fn queued_len(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// Stops the scheduler.
    ///
    /// Queued-but-not-started tasks are cancelled (their handles resolve with
    /// [`TaskError::Cancelled`]); in-flight tasks are allowed to finish.
    /// Resolves once every worker has exited.
    pub async fn shutdown(&self) {
        debug!(scheduler = %self.label, "Scheduler shutting down");
        self.inner.shutdown.cancel();
        self.inner.slots.close();

        // Wait for in-flight tasks to finish.
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(scheduler = %self.label, error = %e, "Scheduler worker aborted");
            }
        }

        // Cancel whatever is still queued. Workers are gone, so nothing else
        // will pull from the queue; submits that slipped past the token check
        // were enqueued before the lock below and are drained here.
        let cancelled = {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.drain()
        };
        if !cancelled.is_empty() {
            debug!(
                scheduler = %self.label,
                cancelled = cancelled.len(),
                "Cancelled queued tasks on shutdown"
            );
        }
        for task in cancelled {
            let _ = task.done.send(Err(TaskError::Cancelled));
        }
    }
}

async fn worker_loop<T: Send + 'static>(inner: Arc<Inner<T>>, scheduler: String, index: usize) {
    trace!(scheduler = %scheduler, worker = index, "Worker started");

    loop {
        // One permit per queued task; Err means the semaphore was closed for
        // shutdown.
        let permit = match inner.slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        permit.forget();

        let task = inner.queue.lock().unwrap().pop();
        let Some(task) = task else {
            // Shutdown drained the queue between our acquire and pop.
            continue;
        };

        trace!(scheduler = %scheduler, worker = index, task = %task.label, "Task started");

        // A panicking task must still resolve its handle exactly once.
        let result = match std::panic::AssertUnwindSafe(task.future).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic);
                warn!(
                    scheduler = %scheduler,
                    task = %task.label,
                    panic = %message,
                    "Task panicked"
                );
                Err(TaskError::Panicked(message))
            }
        };

        trace!(
            scheduler = %scheduler,
            worker = index,
            task = %task.label,
            ok = result.is_ok(),
            "Task finished"
        );

        // The receiver may have been dropped; that only means the submitter
        // stopped caring.
        let _ = task.done.send(result);
    }

    trace!(scheduler = %scheduler, worker = index, "Worker stopped");
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn submit_and_join_success() {
        let scheduler: TaskScheduler<u32> = TaskScheduler::new("test", 2);
        let handle = scheduler.submit("answer", TaskPriority::High, async { Ok(42) });
        assert_eq!(handle.join().await.unwrap(), 42);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn submit_and_join_failure() {
        let scheduler: TaskScheduler<u32> = TaskScheduler::new("test", 1);
        let handle = scheduler.submit("boom", TaskPriority::High, async {
            Err(TaskError::Failed("device unreachable".to_string()))
        });
        assert_eq!(
            handle.join().await.unwrap_err(),
            TaskError::Failed("device unreachable".to_string())
        );
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_task_resolves_handle() {
        let scheduler: TaskScheduler<u32> = TaskScheduler::new("test", 1);
        let handle = scheduler.submit("panics", TaskPriority::High, async { panic!("kaboom") });
        match handle.join().await.unwrap_err() {
            TaskError::Panicked(message) => assert!(message.contains("kaboom")),
            other => panic!("expected panic error, got {:?}", other),
        }

        // The worker survives the panic and keeps executing.
        let handle = scheduler.submit("after", TaskPriority::High, async { Ok(1) });
        assert_eq!(handle.join().await.unwrap(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn high_priority_completes_before_queued_low() {
        let scheduler: TaskScheduler<String> = TaskScheduler::new("test", 1);
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        // Occupy the single worker so everything below stays queued.
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let blocker = scheduler.submit("blocker", TaskPriority::High, async move {
            let _ = gate_rx.await;
            Ok("blocker".to_string())
        });

        let mut handles = Vec::new();
        for i in 0..10 {
            let order = Arc::clone(&order);
            handles.push(scheduler.submit(format!("low{}", i), TaskPriority::Low, async move {
                let label = format!("low{}", i);
                order.lock().unwrap().push(label.clone());
                Ok(label)
            }));
        }
        let order_clone = Arc::clone(&order);
        let high = scheduler.submit("high", TaskPriority::High, async move {
            order_clone.lock().unwrap().push("high".to_string());
            Ok("high".to_string())
        });

        gate_tx.send(()).unwrap();
        blocker.join().await.unwrap();
        high.join().await.unwrap();
        for handle in handles {
            handle.join().await.unwrap();
        }

        let order = order.lock().unwrap();
        assert_eq!(order[0], "high", "HIGH must run before any queued LOW");
        assert_eq!(order.len(), 11);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_and_finishes_in_flight() {
        let scheduler: Arc<TaskScheduler<u32>> = Arc::new(TaskScheduler::new("test", 1));

        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let in_flight = scheduler.submit("in-flight", TaskPriority::High, async move {
            let _ = gate_rx.await;
            Ok(7)
        });
        // Give the worker a chance to pull the first task, so the next
        // submit stays queued behind it.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let queued = scheduler.submit("queued", TaskPriority::Low, async { Ok(8) });

        // Begin shutdown while the worker is still blocked; intake closes
        // before the gate opens, so the queued task can never start.
        let shutdown = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.shutdown().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate_tx.send(()).unwrap();
        shutdown.await.unwrap();

        assert_eq!(in_flight.join().await.unwrap(), 7);
        assert_eq!(queued.join().await.unwrap_err(), TaskError::Cancelled);
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_cancelled() {
        let scheduler: TaskScheduler<u32> = TaskScheduler::new("test", 1);
        scheduler.shutdown().await;

        let handle = scheduler.submit("late", TaskPriority::High, async { Ok(1) });
        assert_eq!(handle.join().await.unwrap_err(), TaskError::Cancelled);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let scheduler: TaskScheduler<u32> = TaskScheduler::new("test", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..12 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(scheduler.submit(format!("t{}", i), TaskPriority::High, async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(0)
            }));
        }
        for handle in handles {
            handle.join().await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "worker bound violated");
        scheduler.shutdown().await;
    }
}
