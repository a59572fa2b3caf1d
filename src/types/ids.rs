//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID kinds (e.g., using a
//! step id where a poller instance id is expected) and make signatures
//! self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The stable identifier of a poller instance.
///
/// Used as the key for persisted state; two instances with the same id would
/// clobber each other's checkpoints, so the registry rejects duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PollerId(pub String);

impl PollerId {
    pub fn new(s: impl Into<String>) -> Self {
        PollerId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PollerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PollerId {
    fn from(s: &str) -> Self {
        PollerId(s.to_string())
    }
}

impl From<String> for PollerId {
    fn from(s: String) -> Self {
        PollerId(s)
    }
}

/// The identifier of a single collect step within a workflow.
///
/// Doubles as the artifact key: a step that completed has written exactly one
/// artifact under its own id, which is what restore uses as the resumption
/// cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(s: impl Into<String>) -> Self {
        StepId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        StepId(s.to_string())
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
