//! Per-cycle state and cumulative poller statistics.
//!
//! A cycle is one full pass through the engine from PREPARE to COMPLETED or
//! FAILED. `CycleState` is owned exclusively by the engine that created it,
//! mutated only by the engine's own execution, and either promoted into
//! `PollerStats` and cleared at COMPLETED or converted into `last_error` and
//! discarded at FAILED.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque partial results carried between phases.
///
/// Each key is written by exactly one phase and read by the next (e.g., a
/// local file path written by the collect step, then a remote handle derived
/// from it by the transfer step). Keys are the step ids that produced them.
pub type ArtifactMap = BTreeMap<String, Value>;

/// State of one in-flight polling cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleState {
    /// Monotonically increasing per poller instance.
    pub cycle_number: u64,

    /// When this cycle's work portion began.
    pub started_at: Option<DateTime<Utc>>,

    /// When this cycle reached COMPLETED or FAILED.
    pub ended_at: Option<DateTime<Utc>>,

    /// Partial results carried between phases; one writer per key.
    pub artifacts: ArtifactMap,

    /// Per-phase retry counters, reset at the start of every new cycle.
    pub retry_counters: BTreeMap<String, u32>,

    /// The error that ended this cycle, if it failed.
    pub last_error: Option<String>,

    /// True once the cycle's result has been reported.
    pub succeeded: bool,
}

impl CycleState {
    /// Creates the state for a fresh cycle.
    pub fn new(cycle_number: u64) -> Self {
        CycleState {
            cycle_number,
            started_at: Some(Utc::now()),
            ended_at: None,
            artifacts: ArtifactMap::new(),
            retry_counters: BTreeMap::new(),
            last_error: None,
            succeeded: false,
        }
    }

    /// Returns the retry count recorded for a phase (0 if never retried).
    pub fn retries_for(&self, phase: &str) -> u32 {
        self.retry_counters.get(phase).copied().unwrap_or(0)
    }

    /// Increments the retry counter for a phase and returns the new value.
    pub fn bump_retry(&mut self, phase: &str) -> u32 {
        let counter = self.retry_counters.entry(phase.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Records the terminal error for this cycle.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.succeeded = false;
        self.ended_at = Some(Utc::now());
    }

    /// Marks the cycle as successfully reported.
    pub fn complete(&mut self) {
        self.succeeded = true;
        self.ended_at = Some(Utc::now());
    }
}

/// Attempt/retry counts for a single phase, accumulated across cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStats {
    /// Total times the phase body was entered.
    pub attempts: u64,

    /// Total times the phase was re-entered after a recoverable failure.
    pub retries: u64,
}

/// Cumulative statistics for a poller instance.
///
/// Persists across cycles and restarts; never reset except on explicit
/// re-initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerStats {
    /// Cycles that reached PREPARE.
    pub cycles_started: u64,

    /// Cycles that reached COMPLETED.
    pub cycles_completed: u64,

    /// Cycles that reached FAILED.
    pub cycles_failed: u64,

    /// Per-phase attempt/retry counts, keyed by phase name.
    pub phase_attempts: BTreeMap<String, PhaseStats>,
}

impl PollerStats {
    /// Records one entry into a phase body.
    pub fn record_attempt(&mut self, phase: &str) {
        self.phase_attempts
            .entry(phase.to_string())
            .or_default()
            .attempts += 1;
    }

    /// Records one budgeted retry of a phase.
    pub fn record_retry(&mut self, phase: &str) {
        self.phase_attempts
            .entry(phase.to_string())
            .or_default()
            .retries += 1;
    }
}

/// The result delivered to the caller once per completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Cycle number the report belongs to.
    pub cycle_number: u64,

    /// The assembled collection result.
    pub collected: Value,

    /// When the cycle's work began.
    pub cycle_start: DateTime<Utc>,

    /// When the report was assembled.
    pub cycle_end: DateTime<Utc>,
}
