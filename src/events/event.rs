//! The lifecycle event type.

use crate::types::{CycleReport, PollerId};

/// A lifecycle transition of a poller engine.
///
/// The set is closed: external coordination (registries, status endpoints,
/// consumers of collected data) keys off these five kinds and nothing else.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// The engine finished initializing and is driving its state machine.
    Started {
        /// The emitting instance.
        poller: PollerId,
    },

    /// A cycle completed its work portion; carries the collected result.
    ///
    /// Emitted exactly once per completed cycle.
    Report {
        /// The emitting instance.
        poller: PollerId,
        /// The cycle's collected data and timing.
        report: CycleReport,
    },

    /// A cycle finished (stats already updated).
    Completed {
        /// The emitting instance.
        poller: PollerId,
        /// The cycle that completed.
        cycle_number: u64,
    },

    /// The engine observed its cancellation signal and is tearing down.
    Disabling {
        /// The emitting instance.
        poller: PollerId,
    },

    /// Terminal: the engine stopped. Always the last event an instance
    /// emits; the instance may afterwards be restarted or disposed.
    Died {
        /// The emitting instance.
        poller: PollerId,
        /// The terminal error, if the engine died failing.
        error: Option<String>,
    },
}

impl LifecycleEvent {
    /// Returns the event kind as a short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::Started { .. } => "started",
            LifecycleEvent::Report { .. } => "report",
            LifecycleEvent::Completed { .. } => "completed",
            LifecycleEvent::Disabling { .. } => "disabling",
            LifecycleEvent::Died { .. } => "died",
        }
    }

    /// Returns the id of the instance that emitted this event.
    pub fn poller(&self) -> &PollerId {
        match self {
            LifecycleEvent::Started { poller }
            | LifecycleEvent::Report { poller, .. }
            | LifecycleEvent::Completed { poller, .. }
            | LifecycleEvent::Disabling { poller }
            | LifecycleEvent::Died { poller, .. } => poller,
        }
    }
}
