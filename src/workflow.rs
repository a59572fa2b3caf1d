//! The per-poller work abstraction: an ordered list of collect steps.
//!
//! A workflow owns the "do the work" portion of a cycle. The engine drives
//! its steps in order, persists a checkpoint after each one, and uses the
//! artifact each step writes (keyed by the step's own id) as the resumption
//! cursor after a crash: a step whose artifact is present is never redone.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigCache, ConfigError};
use crate::scheduler::{TaskError, TaskScheduler};
use crate::types::{ArtifactMap, StepId};

/// An error escaping a collect step.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// Caught at the phase boundary and routed through the retry budget.
    #[error("{0}")]
    Recoverable(String),

    /// Forces an immediate cleanup and cycle failure, no retry.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StepError {
    /// Convenience constructor for [`StepError::Recoverable`].
    pub fn recoverable(message: impl Into<String>) -> Self {
        StepError::Recoverable(message.into())
    }

    /// Convenience constructor for [`StepError::Fatal`].
    pub fn fatal(message: impl Into<String>) -> Self {
        StepError::Fatal(message.into())
    }
}

// Missing/invalid configuration surfaces at the first step that needs it and
// retries under that step's budget.
impl From<ConfigError> for StepError {
    fn from(e: ConfigError) -> Self {
        StepError::Recoverable(e.to_string())
    }
}

impl From<TaskError> for StepError {
    fn from(e: TaskError) -> Self {
        StepError::Recoverable(e.to_string())
    }
}

/// What a step sees while running: the cycle's artifacts, the instance's
/// scheduler, configuration, and the cancellation signal.
pub struct StepContext<'a> {
    artifacts: &'a mut ArtifactMap,
    scheduler: &'a TaskScheduler<Value>,
    config: &'a ConfigCache,
    cancel: &'a CancellationToken,
}

impl<'a> StepContext<'a> {
    /// Assembles a context for one step invocation.
    pub fn new(
        artifacts: &'a mut ArtifactMap,
        scheduler: &'a TaskScheduler<Value>,
        config: &'a ConfigCache,
        cancel: &'a CancellationToken,
    ) -> Self {
        StepContext {
            artifacts,
            scheduler,
            config,
            cancel,
        }
    }

    /// The instance's task scheduler; submit remote I/O here.
    pub fn scheduler(&self) -> &TaskScheduler<Value> {
        self.scheduler
    }

    /// The instance's configuration (fetched lazily, cached).
    pub async fn config(&self) -> Result<std::sync::Arc<crate::config::PollerConfig>, StepError> {
        Ok(self.config.get().await?)
    }

    /// The engine's cancellation signal. Long-running step bodies should
    /// check it between units of work.
    pub fn cancel(&self) -> &CancellationToken {
        self.cancel
    }

    /// Stores the artifact a step produced under the step's id.
    pub fn store_artifact(&mut self, step: &StepId, value: Value) {
        self.artifacts.insert(step.as_str().to_string(), value);
    }

    /// Returns an artifact written by an earlier step, if present.
    pub fn artifact(&self, key: &str) -> Option<&Value> {
        self.artifacts.get(key)
    }

    /// Returns an artifact an earlier step must have written.
    ///
    /// A missing required artifact is an invariant violation (phases execute
    /// strictly in order), so this is a fatal error rather than a retry.
    pub fn require_artifact(&self, key: &str) -> Result<&Value, StepError> {
        self.artifacts
            .get(key)
            .ok_or_else(|| StepError::fatal(format!("required artifact '{}' is missing", key)))
    }
}

/// The "do the work" portion of one poller variant.
///
/// Implementations must keep two invariants:
///
/// - `run_step` for step S writes exactly one artifact, under key
///   `S.as_str()`, on success (the engine verifies this).
/// - Steps only read artifacts of earlier steps.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Workflow name, used for logging and scheduler labels.
    fn name(&self) -> &str;

    /// The ordered collect steps of one cycle.
    fn steps(&self) -> &[StepId];

    /// Executes one step.
    async fn run_step(&self, step: &StepId, cx: &mut StepContext<'_>) -> Result<(), StepError>;

    /// Builds the report payload from the finished cycle's artifacts.
    fn assemble_report(&self, artifacts: &ArtifactMap) -> Result<Value, StepError>;

    /// Releases local resources referenced by artifacts (temp files and the
    /// like). Runs on every exit path, success or not; must tolerate partial
    /// artifact sets.
    async fn cleanup(&self, artifacts: &mut ArtifactMap);

    /// Whether a persisted artifact still proves its step completed.
    ///
    /// Restore treats an invalid artifact as absent, so the step reruns.
    /// The default accepts everything; workflows whose artifacts reference
    /// external resources (a local file path) should verify them.
    fn artifact_is_valid(&self, _step: &StepId, _artifact: &Value) -> bool {
        true
    }
}
