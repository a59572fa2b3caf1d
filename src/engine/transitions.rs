//! Pure state transitions for the poller engine.
//!
//! The driver executes one state body, classifies what happened as a
//! [`StateOutcome`], and asks [`next_state`] where to go. Keeping this a pure
//! function of `(state, outcome, context)` makes the whole topology testable
//! as a table, with no string-keyed dispatch at runtime.

use std::time::Duration;

use super::state::{EngineState, RunMode};

/// What happened while executing a state body.
#[derive(Debug, Clone, PartialEq)]
pub enum StateOutcome {
    /// The body finished normally; take the success edge.
    Advance,

    /// Restore (or record loading) computed an explicit resume target.
    ResumeAt(EngineState),

    /// The schedule check found the cycle due now.
    Due,

    /// The schedule check found time remaining before the cycle is due.
    NotDue {
        /// Time until the next execution.
        wait: Duration,
    },

    /// A phase failed recoverably and its budget allows another attempt.
    RetryAfter {
        /// The phase's fixed retry delay.
        delay: Duration,
    },

    /// A phase failed recoverably and its budget is exhausted.
    Exhausted,

    /// A fatal error escaped the body; no retry.
    Fatal,

    /// The cancellation flag was observed at state entry.
    Interrupted,

    /// FAILED's own handler failed; forces an unconditional reschedule.
    HandlerFailed,
}

/// Context the transition function needs beyond the state itself.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext {
    /// Number of collect steps in the workflow.
    pub step_count: usize,

    /// The engine's run mode.
    pub mode: RunMode,

    /// True once the cancellation signal has been observed.
    pub disabled: bool,
}

/// Error returned when a `(state, outcome)` pair is not in the table.
///
/// The driver treats this as a fatal engine error (it indicates a bug in the
/// driver, not in the remote device).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition from {from} with outcome {outcome}")]
pub struct TransitionError {
    /// Name of the state the invalid outcome came from.
    pub from: &'static str,
    /// Debug rendering of the outcome.
    pub outcome: String,
}

fn invalid(from: &EngineState, outcome: &StateOutcome) -> TransitionError {
    TransitionError {
        from: from.name(),
        outcome: format!("{:?}", outcome),
    }
}

/// Computes the next state.
///
/// Success edges follow the state table; error edges route through CLEANUP
/// before FAILED so local artifacts are released on every path; an observed
/// cancellation signal wins over everything a state would otherwise do.
pub fn next_state(
    current: &EngineState,
    outcome: StateOutcome,
    ctx: &TransitionContext,
) -> Result<EngineState, TransitionError> {
    use EngineState::*;
    use StateOutcome::*;

    // Cancellation: any interruptible state short-circuits to DISABLED.
    if outcome == Interrupted {
        return if current.is_interruptible() {
            Ok(Disabled)
        } else {
            Err(invalid(current, &Interrupted))
        };
    }

    // A fatal error forces an immediate CLEANUP -> FAILED from anywhere.
    // The teardown states never produce Fatal (their bodies swallow their
    // own errors), so this cannot loop.
    if outcome == Fatal {
        return Ok(Cleanup {
            next: Box::new(Failed),
        });
    }

    match (current, outcome) {
        // Start-up chain.
        (Uninitialized, Advance) => Ok(Initialized),
        (Initialized, Advance) => Ok(Prepare),
        (Initialized, ResumeAt(target)) => Ok(target),
        (Restore, ResumeAt(target)) => Ok(target),

        // Scheduling. SCHEDULE is the first phase that needs configuration,
        // so it participates in the retry-budget machinery like any other
        // failing phase.
        (Prepare, Advance) => Ok(Schedule),
        (Schedule, Advance) => Ok(ScheduleCheck),
        (Schedule, RetryAfter { delay }) => Ok(Sleep {
            wait: delay,
            resume: Box::new(Schedule),
        }),
        (Schedule, Exhausted) => Ok(Cleanup {
            next: Box::new(Failed),
        }),
        (ScheduleCheck, Due) => {
            if ctx.step_count > 0 {
                Ok(Step(0))
            } else {
                Ok(Process)
            }
        }
        (ScheduleCheck, NotDue { wait }) => Ok(Sleep {
            wait,
            resume: Box::new(ScheduleCheck),
        }),
        (Sleep { resume, .. }, Advance) => Ok((**resume).clone()),

        // Collect steps.
        (Step(k), Advance) => {
            if k + 1 < ctx.step_count {
                Ok(Step(k + 1))
            } else {
                Ok(Process)
            }
        }
        (Step(k), RetryAfter { delay }) => Ok(Sleep {
            wait: delay,
            resume: Box::new(Step(*k)),
        }),
        (Step(_), Exhausted) => Ok(Cleanup {
            next: Box::new(Failed),
        }),

        // Reporting. PROCESS has no retry budget; any failure there ends the
        // cycle.
        (Process, Advance) => Ok(Cleanup {
            next: Box::new(Completed),
        }),
        (Process, Exhausted) => Ok(Cleanup {
            next: Box::new(Failed),
        }),

        // Cycle ends.
        (Completed, Advance) => {
            if ctx.mode.is_one_shot() {
                Ok(Died)
            } else {
                Ok(Prepare)
            }
        }
        (Failed, Advance) => {
            if ctx.mode.is_one_shot() || ctx.disabled {
                Ok(Died)
            } else {
                Ok(Prepare)
            }
        }
        (Failed, HandlerFailed) => Ok(Schedule),

        // Teardown.
        (Disabled, Advance) => Ok(Cleanup {
            next: Box::new(Died),
        }),
        (Cleanup { next }, Advance) => Ok((**next).clone()),

        (current, outcome) => Err(invalid(current, &outcome)),
    }
}
