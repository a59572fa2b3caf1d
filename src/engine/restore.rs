//! Mapping a persisted record to a resume state.
//!
//! Executed once, in RESTORE, after a restart found a checkpoint. The
//! artifact each collect step writes under its own id is the resumption
//! cursor: a step whose (valid) artifact survived is never redone, so at most
//! one sub-step repeats after a crash, and a fully-reported cycle is never
//! re-reported.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::state::EngineState;
use crate::persist::{CheckpointPhase, StorageRecord};
use crate::workflow::Workflow;

/// The computed resume plan.
#[derive(Debug, Clone, PartialEq)]
pub struct RestorePlan {
    /// The state to resume at.
    pub resume: EngineState,

    /// Artifact keys that no longer prove their step completed (e.g., a
    /// temp file that vanished); the engine drops them before resuming so
    /// the owning step reruns.
    pub drop_artifacts: Vec<String>,
}

impl RestorePlan {
    fn resume_at(state: EngineState) -> Self {
        RestorePlan {
            resume: state,
            drop_artifacts: Vec::new(),
        }
    }

    /// The stale-cycle fallback: clean up, then start fresh.
    fn discard() -> Self {
        RestorePlan::resume_at(EngineState::Cleanup {
            next: Box::new(EngineState::Prepare),
        })
    }
}

/// Computes where to resume from a persisted record.
///
/// - SCHEDULE checkpoint: resume the schedule check if the recorded due time
///   is still in the future or within the bounded past-due window; otherwise
///   recompute a fresh schedule.
/// - Collect-step checkpoint: resume at the checkpointed step if its output
///   artifact is absent or invalid, else advance past it. The terminal step
///   is always re-entered so its result is re-confirmed before reporting.
/// - Anything unusable (unknown step, already-reported cycle under a step
///   checkpoint): fall back to CLEANUP, discarding the stale cycle.
pub fn plan_resume(
    record: &StorageRecord,
    workflow: &dyn Workflow,
    now: DateTime<Utc>,
    past_due_window: Duration,
) -> RestorePlan {
    match &record.checkpoint {
        CheckpointPhase::Schedule => {
            let next = record.schedule.next_execution;
            let deadline = chrono::Duration::from_std(past_due_window)
                .ok()
                .and_then(|window| next.checked_add_signed(window))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            if now < deadline {
                debug!(next_execution = %next, "Resuming schedule check from checkpoint");
                RestorePlan::resume_at(EngineState::ScheduleCheck)
            } else {
                debug!(
                    next_execution = %next,
                    "Schedule checkpoint past due window, recomputing"
                );
                RestorePlan::resume_at(EngineState::Schedule)
            }
        }

        CheckpointPhase::Step { id } => {
            let steps = workflow.steps();
            let Some(index) = steps.iter().position(|s| s == id) else {
                warn!(step = %id, "Checkpointed step unknown to workflow, discarding cycle");
                return RestorePlan::discard();
            };

            // A reported cycle must never re-report; a step checkpoint with
            // `succeeded` set means the cleanup checkpoint was lost. Discard
            // rather than rerun.
            if record.cycle.succeeded {
                warn!(step = %id, "Step checkpoint for already-reported cycle, discarding");
                return RestorePlan::discard();
            }

            let artifact = record.cycle.artifacts.get(id.as_str());
            let artifact_ok = match artifact {
                Some(value) => workflow.artifact_is_valid(id, value),
                None => false,
            };

            if !artifact_ok {
                let drop_artifacts = if artifact.is_some() {
                    vec![id.as_str().to_string()]
                } else {
                    Vec::new()
                };
                debug!(step = %id, "Resuming at checkpointed step (no usable artifact)");
                return RestorePlan {
                    resume: EngineState::Step(index),
                    drop_artifacts,
                };
            }

            if index + 1 < steps.len() {
                // The step's output survived; never redo a completed
                // sub-step.
                debug!(step = %id, "Artifact present, advancing past checkpointed step");
                RestorePlan::resume_at(EngineState::Step(index + 1))
            } else {
                // Terminal work step: its result was not yet reported, so
                // re-enter it to re-fetch/re-confirm before reporting.
                debug!(step = %id, "Re-confirming terminal step before reporting");
                RestorePlan::resume_at(EngineState::Step(index))
            }
        }

        CheckpointPhase::Cleanup => {
            // The recorded cycle fully finished; start the next one.
            debug!("Cleanup checkpoint found, starting a fresh cycle");
            RestorePlan::resume_at(EngineState::Prepare)
        }
    }
}
