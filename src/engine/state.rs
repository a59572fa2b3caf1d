//! Engine states and the runtime mode.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::{PollerId, PollerStats};

/// How an engine instance schedules and persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Interval-driven, persisted, loops back to a new cycle after each
    /// completion.
    Recurring,

    /// On-demand: "due" is always now, nothing is persisted, and the engine
    /// dies after one cycle.
    OneShot,
}

impl RunMode {
    /// Returns true for the one-shot variant.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, RunMode::OneShot)
    }
}

/// A state of the engine's driver loop.
///
/// The "do the work" portion is `Step(k)`, an index into the workflow's
/// ordered step list; everything else is common machinery. Transitions
/// between states are computed by [`super::transitions::next_state`].
#[derive(Debug, Clone, PartialEq)]
pub enum EngineState {
    /// Idle, pre-start.
    Uninitialized,

    /// Loading the persisted record, if any.
    Initialized,

    /// Mapping the persisted checkpoint to a resume state.
    Restore,

    /// Allocating a fresh cycle.
    Prepare,

    /// Computing the next execution time.
    Schedule,

    /// Comparing now against the next execution time.
    ScheduleCheck,

    /// Cooperative wait; resumes `resume` when the timer elapses, unless the
    /// cancellation signal wins the race.
    Sleep {
        /// How long to wait.
        wait: Duration,
        /// The state to resume when the wait elapses.
        resume: Box<EngineState>,
    },

    /// Executing collect step `k` of the workflow.
    Step(usize),

    /// Assembling and reporting the cycle's result.
    Process,

    /// Bumping completion stats and emitting `completed`.
    Completed,

    /// Recording the cycle's terminal error.
    Failed,

    /// The cancellation signal was observed; tearing down.
    Disabled,

    /// Releasing local artifacts, regardless of the path taken here.
    Cleanup {
        /// Where to go once cleanup ran.
        next: Box<EngineState>,
    },

    /// Terminal. The instance returns to `Uninitialized` for potential
    /// reuse.
    Died,
}

impl EngineState {
    /// Returns the state name for logging and snapshots.
    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Initialized => "initialized",
            EngineState::Restore => "restore",
            EngineState::Prepare => "prepare",
            EngineState::Schedule => "schedule",
            EngineState::ScheduleCheck => "schedule_check",
            EngineState::Sleep { .. } => "sleep",
            EngineState::Step(_) => "collect",
            EngineState::Process => "process",
            EngineState::Completed => "completed",
            EngineState::Failed => "failed",
            EngineState::Disabled => "disabled",
            EngineState::Cleanup { .. } => "cleanup",
            EngineState::Died => "died",
        }
    }

    /// Whether entering this state first checks the cancellation flag.
    ///
    /// Cancellation is cooperative: the waiting and working states are
    /// interruptible, but the teardown path (FAILED, DISABLED, CLEANUP,
    /// DIED) always runs so artifacts are released and the terminal event
    /// fires exactly once.
    pub fn is_interruptible(&self) -> bool {
        !matches!(
            self,
            EngineState::Uninitialized
                | EngineState::Failed
                | EngineState::Disabled
                | EngineState::Cleanup { .. }
                | EngineState::Died
        )
    }

    /// Whether a checkpoint is written when this state exits successfully.
    pub fn persists_on_exit(&self) -> bool {
        matches!(
            self,
            EngineState::Schedule | EngineState::Step(_) | EngineState::Cleanup { .. }
        )
    }

    /// Returns true for the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Died)
    }
}

/// Point-in-time snapshot of an engine, published through a watch channel so
/// `info()` readers never block the engine.
#[derive(Debug, Clone)]
pub struct PollerInfo {
    /// The instance id.
    pub id: PollerId,

    /// Name of the current state.
    pub state: &'static str,

    /// Current collect step name, when in a collect state.
    pub current_step: Option<String>,

    /// Cycle number of the in-flight (or most recent) cycle.
    pub cycle_number: u64,

    /// Cumulative statistics.
    pub stats: PollerStats,

    /// When the next cycle is due, if scheduled.
    pub next_execution: Option<DateTime<Utc>>,

    /// Most recent cycle error, if any.
    pub last_error: Option<String>,

    /// True while the engine task is running (false once died).
    pub active: bool,
}

impl PollerInfo {
    /// Creates the pre-start snapshot.
    pub fn idle(id: PollerId) -> Self {
        PollerInfo {
            id,
            state: EngineState::Uninitialized.name(),
            current_step: None,
            cycle_number: 0,
            stats: PollerStats::default(),
            next_execution: None,
            last_error: None,
            active: false,
        }
    }

    /// Time remaining until the next execution, zero if already due, `None`
    /// if nothing is scheduled.
    pub fn time_until_next(&self) -> Option<Duration> {
        let next = self.next_execution?;
        let remaining = next - Utc::now();
        Some(remaining.to_std().unwrap_or(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_states_are_not_interruptible() {
        assert!(!EngineState::Failed.is_interruptible());
        assert!(!EngineState::Disabled.is_interruptible());
        assert!(
            !EngineState::Cleanup {
                next: Box::new(EngineState::Died)
            }
            .is_interruptible()
        );
        assert!(!EngineState::Died.is_interruptible());
        assert!(!EngineState::Uninitialized.is_interruptible());
    }

    #[test]
    fn waiting_and_working_states_are_interruptible() {
        assert!(EngineState::ScheduleCheck.is_interruptible());
        assert!(EngineState::Step(0).is_interruptible());
        assert!(EngineState::Process.is_interruptible());
        assert!(
            EngineState::Sleep {
                wait: Duration::from_secs(1),
                resume: Box::new(EngineState::ScheduleCheck)
            }
            .is_interruptible()
        );
    }

    #[test]
    fn persistent_states_match_the_state_table() {
        assert!(EngineState::Schedule.persists_on_exit());
        assert!(EngineState::Step(2).persists_on_exit());
        assert!(
            EngineState::Cleanup {
                next: Box::new(EngineState::Completed)
            }
            .persists_on_exit()
        );

        assert!(!EngineState::Prepare.persists_on_exit());
        assert!(!EngineState::ScheduleCheck.persists_on_exit());
        assert!(!EngineState::Process.persists_on_exit());
        assert!(!EngineState::Completed.persists_on_exit());
    }

    #[test]
    fn time_until_next_is_zero_when_overdue() {
        let mut info = PollerInfo::idle(PollerId::new("p1"));
        info.next_execution = Some(Utc::now() - chrono::Duration::seconds(30));
        assert_eq!(info.time_until_next(), Some(Duration::ZERO));
    }
}
