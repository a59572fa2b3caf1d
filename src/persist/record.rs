//! The durable progress record written at persistent phase exits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CycleState, PollerStats, StepId};

/// Current record format version. Increment on breaking changes.
pub const FORMAT_VERSION: u32 = 1;

/// The phase a checkpoint was taken at.
///
/// INVARIANT: only phases whose exit is marked "persist on exit" appear here
/// (schedule, a collect step, cleanup); restore never resumes into a
/// non-persisted phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum CheckpointPhase {
    /// The next execution time was computed and recorded.
    Schedule,

    /// A collect step exited; `id` names the step.
    Step {
        /// The step the checkpoint was taken at.
        id: StepId,
    },

    /// Cleanup ran; the recorded cycle is finished (reported or discarded).
    Cleanup,
}

impl CheckpointPhase {
    /// Returns the phase name for logging.
    pub fn name(&self) -> &str {
        match self {
            CheckpointPhase::Schedule => "schedule",
            CheckpointPhase::Step { id } => id.as_str(),
            CheckpointPhase::Cleanup => "cleanup",
        }
    }
}

/// Persisted scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    /// When the next cycle is due to begin.
    pub next_execution: DateTime<Utc>,
}

/// The serialized progress of one poller instance.
///
/// Written at every phase exit flagged persistent; read once, at engine
/// initialization, to decide whether to start fresh or resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    /// Record format version, checked on load.
    pub format_version: u32,

    /// The last persisted phase; the resume anchor.
    pub checkpoint: CheckpointPhase,

    /// Scheduling state.
    pub schedule: ScheduleState,

    /// Cumulative statistics.
    pub stats: PollerStats,

    /// The in-flight cycle at checkpoint time.
    pub cycle: CycleState,
}

impl StorageRecord {
    /// Creates a record at the current format version.
    pub fn new(
        checkpoint: CheckpointPhase,
        next_execution: DateTime<Utc>,
        stats: PollerStats,
        cycle: CycleState,
    ) -> Self {
        StorageRecord {
            format_version: FORMAT_VERSION,
            checkpoint,
            schedule: ScheduleState { next_execution },
            stats,
            cycle,
        }
    }
}
