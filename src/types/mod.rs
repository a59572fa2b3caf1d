//! Core domain types for the telemetry poller.
//!
//! This module contains the fundamental types used throughout the crate,
//! designed to encode invariants via the type system.

pub mod cycle;
pub mod ids;

// Re-export commonly used types at the module level
pub use cycle::{ArtifactMap, CycleReport, CycleState, PhaseStats, PollerStats};
pub use ids::{PollerId, StepId};
