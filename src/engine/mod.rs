//! The resilient polling state machine.
//!
//! This module implements the core engine that drives one poller instance:
//!
//! - **Transitions** ([`transitions`]): the whole state topology as a pure
//!   function of `(state, outcome, context)`, testable as a table.
//! - **Restore** ([`restore`]): the crash-recovery mapping from a persisted
//!   checkpoint to a resume state, using artifact presence as the resumption
//!   cursor.
//! - **Driver** ([`driver`]): the async loop that executes state bodies,
//!   checkpoints persistent phase exits, routes recoverable failures through
//!   the retry budget, and races waits against the cancellation signal.
//!
//! # Key invariants
//!
//! 1. **Checkpoint ordering**: no phase begins before the previous phase's
//!    checkpoint (if persistent) was durably written.
//! 2. **Resumption cursor**: restore resumes at the checkpointed step or the
//!    one after it, never earlier, and never re-reports a reported cycle.
//! 3. **Cycle isolation**: cycle N's state is fully cleared before cycle
//!    N+1's PREPARE.

mod driver;
pub mod restore;
mod state;
pub mod transitions;

#[cfg(test)]
mod engine_tests;

pub(crate) use driver::{EngineOptions, PollerEngine};
pub use restore::RestorePlan;
pub use state::{EngineState, PollerInfo, RunMode};
pub use transitions::{StateOutcome, TransitionContext, TransitionError, next_state};
