//! Retry policy: per-phase budgets and transient-error retry for tasks.
//!
//! Two orthogonal mechanisms live here:
//!
//! - [`RetryBudget`] is the *phase-level* policy the engine consults when a
//!   collect phase fails with a recoverable error: retry in place with a
//!   fixed delay, or give up and fail the cycle. Budgets are phase-specific
//!   and configuration-supplied — a cheap local operation may allow many fast
//!   retries while a rate-limited remote operation allows few, spaced-out
//!   ones.
//!
//! - [`retry_with_backoff`] is the *task-level* helper a collect task applies
//!   internally before it is considered failed at all (e.g., re-asking a
//!   remote service whether analysis has finished). The scheduler never sees
//!   these retries; a task that exhausts them reports a single terminal error
//!   through its completion handle.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A single phase's retry allowance.
///
/// Static, configuration-derived, immutable for the lifetime of a poller
/// instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetEntry {
    /// Maximum recoverable failures tolerated before the phase escalates to
    /// a cycle failure. An entry of N allows N retries, i.e. N+1 attempts.
    pub max_attempts: u32,

    /// Fixed delay slept before each re-entry of the phase.
    #[serde(with = "duration_millis")]
    pub delay: Duration,
}

impl BudgetEntry {
    /// Creates a budget entry.
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        BudgetEntry {
            max_attempts,
            delay,
        }
    }
}

impl Default for BudgetEntry {
    fn default() -> Self {
        BudgetEntry {
            max_attempts: 3,
            delay: Duration::from_secs(30),
        }
    }
}

/// Duration <-> integer milliseconds, so budget tables stay readable in
/// persisted/serialized configuration.
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// The outcome of consulting a budget after a recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enter the same phase after sleeping for `delay`.
    Retry {
        /// Fixed delay from the phase's budget entry.
        delay: Duration,
    },

    /// The budget is exhausted; escalate to a cycle failure.
    GiveUp,
}

/// Per-phase retry budgets for one poller instance.
///
/// Pure policy object: `decide` reads only its inputs and the immutable
/// table, so it is safe to call from any phase without synchronization.
#[derive(Debug, Clone, Default)]
pub struct RetryBudget {
    entries: HashMap<String, BudgetEntry>,
    fallback: BudgetEntry,
}

impl RetryBudget {
    /// Creates a budget with the given per-phase entries and a fallback used
    /// for phases without an explicit entry.
    pub fn new(entries: HashMap<String, BudgetEntry>, fallback: BudgetEntry) -> Self {
        RetryBudget { entries, fallback }
    }

    /// Adds or replaces the entry for one phase.
    pub fn with_entry(mut self, phase: impl Into<String>, entry: BudgetEntry) -> Self {
        self.entries.insert(phase.into(), entry);
        self
    }

    /// Returns the entry that applies to a phase.
    pub fn entry_for(&self, phase: &str) -> BudgetEntry {
        self.entries.get(phase).copied().unwrap_or(self.fallback)
    }

    /// Decides whether a phase that has already failed `attempts` times may
    /// retry, and with what delay.
    ///
    /// `attempts` is the number of recoverable failures observed so far
    /// (i.e., the retry counter *before* this failure is recorded).
    pub fn decide(&self, phase: &str, attempts: u32) -> RetryDecision {
        let entry = self.entry_for(phase);
        if attempts < entry.max_attempts {
            RetryDecision::Retry { delay: entry.delay }
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Result of [`retry_with_backoff`].
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// The operation succeeded within the attempt budget.
    Success(T),

    /// Every attempt failed transiently; carries the last error and the
    /// attempt count.
    Exhausted {
        /// The error from the final attempt.
        last_error: E,
        /// Attempts made, including the initial one.
        attempts: u32,
    },

    /// A non-retryable error ended the attempts immediately.
    Aborted(E),
}

impl<T, E> RetryResult<T, E> {
    /// Converts to a `Result`, discarding the attempt count.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success(v) => Ok(v),
            RetryResult::Exhausted { last_error, .. } => Err(last_error),
            RetryResult::Aborted(e) => Err(e),
        }
    }
}

/// Executes an async operation with bounded fixed-delay retry.
///
/// Errors for which `is_transient` returns true are retried up to
/// `max_attempts` total attempts (minimum 1), sleeping `delay` between them;
/// any other error aborts immediately. This is task-internal retry: callers
/// that need phase-level budgets use [`RetryBudget`] instead.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    max_attempts: u32,
    delay: Duration,
    mut is_transient: P,
    mut operation: F,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return RetryResult::Success(value),
            Err(e) => {
                if !is_transient(&e) {
                    return RetryResult::Aborted(e);
                }
                attempt += 1;
                if attempt >= max_attempts {
                    return RetryResult::Exhausted {
                        last_error: e,
                        attempts: attempt,
                    };
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}
