//! Device metrics poller.
//!
//! One cycle: fetch the device's metrics overview (the primary payload,
//! HIGH priority), then expand the item references the overview lists into
//! per-item statistics (best-effort enrichment, LOW priority, fanned out
//! through the scheduler). Items that fail to expand degrade the report to a
//! partial result; they never fail the cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::budget::retry_with_backoff;
use crate::device::{DeviceClient, DeviceError};
use crate::scheduler::{TaskError, TaskPriority};
use crate::types::{ArtifactMap, StepId};
use crate::workflow::{StepContext, StepError, Workflow};

const STEP_OVERVIEW: &str = "overview";
const STEP_EXPAND: &str = "expand";

/// Transient-error retries applied inside each remote task.
const TASK_ATTEMPTS: u32 = 3;
const TASK_RETRY_DELAY: Duration = Duration::from_secs(2);

/// The metrics collection workflow.
pub struct MetricsWorkflow {
    client: Arc<dyn DeviceClient>,
    steps: Vec<StepId>,
    task_attempts: u32,
    task_retry_delay: Duration,
}

impl MetricsWorkflow {
    /// Creates the workflow.
    pub fn new(client: Arc<dyn DeviceClient>) -> Self {
        MetricsWorkflow {
            client,
            steps: vec![StepId::new(STEP_OVERVIEW), StepId::new(STEP_EXPAND)],
            task_attempts: TASK_ATTEMPTS,
            task_retry_delay: TASK_RETRY_DELAY,
        }
    }

    /// Overrides the task-internal transient retry cadence.
    pub fn with_task_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.task_attempts = attempts;
        self.task_retry_delay = delay;
        self
    }

    async fn run_overview(&self, step: &StepId, cx: &mut StepContext<'_>) -> Result<(), StepError> {
        let config = cx.config().await?;
        let client = Arc::clone(&self.client);
        let device = config.device.clone();
        let (attempts, delay) = (self.task_attempts, self.task_retry_delay);

        let handle = cx.scheduler().submit(
            "metrics/overview",
            TaskPriority::High,
            async move {
                retry_with_backoff(attempts, delay, DeviceError::is_transient, || {
                    let client = Arc::clone(&client);
                    let device = device.clone();
                    async move { client.fetch_overview(&device).await }
                })
                .await
                .into_result()
                .map_err(|e| TaskError::failed(e.to_string()))
            },
        );

        let overview = handle.join().await?;
        cx.store_artifact(step, overview);
        Ok(())
    }

    /// Expands the overview's item references into per-item statistics.
    ///
    /// Each item becomes one LOW-priority task, so enrichment never starves
    /// a concurrently collecting primary payload and the scheduler's worker
    /// bound caps the fan-out against the device.
    async fn run_expand(&self, step: &StepId, cx: &mut StepContext<'_>) -> Result<(), StepError> {
        let config = cx.config().await?;
        let items = item_refs(cx.require_artifact(STEP_OVERVIEW)?);

        let mut handles = Vec::with_capacity(items.len());
        for item in &items {
            let client = Arc::clone(&self.client);
            let device = config.device.clone();
            let item_owned = item.clone();
            let (attempts, delay) = (self.task_attempts, self.task_retry_delay);

            handles.push((
                item.clone(),
                cx.scheduler().submit(
                    format!("metrics/item/{}", item),
                    TaskPriority::Low,
                    async move {
                        retry_with_backoff(attempts, delay, DeviceError::is_transient, || {
                            let client = Arc::clone(&client);
                            let device = device.clone();
                            let item = item_owned.clone();
                            async move { client.fetch_item_stats(&device, &item).await }
                        })
                        .await
                        .into_result()
                        .map_err(|e| TaskError::failed(e.to_string()))
                    },
                ),
            ));
        }

        let mut details = Map::new();
        let mut failed = Vec::new();
        for (item, handle) in handles {
            match handle.join().await {
                Ok(stats) => {
                    details.insert(item, stats);
                }
                Err(e) => {
                    // Best-effort enrichment: a failed item degrades the
                    // report, it does not fail the cycle.
                    warn!(item = %item, error = %e, "Item stats unavailable");
                    failed.push(Value::String(item));
                }
            }
        }

        debug!(
            expanded = details.len(),
            failed = failed.len(),
            "Overview expansion finished"
        );
        cx.store_artifact(
            step,
            json!({ "details": Value::Object(details), "failed": Value::Array(failed) }),
        );
        Ok(())
    }
}

#[async_trait]
impl Workflow for MetricsWorkflow {
    fn name(&self) -> &str {
        "metrics"
    }

    fn steps(&self) -> &[StepId] {
        &self.steps
    }

    async fn run_step(&self, step: &StepId, cx: &mut StepContext<'_>) -> Result<(), StepError> {
        match step.as_str() {
            STEP_OVERVIEW => self.run_overview(step, cx).await,
            STEP_EXPAND => self.run_expand(step, cx).await,
            other => Err(StepError::fatal(format!("unknown step '{}'", other))),
        }
    }

    fn assemble_report(&self, artifacts: &ArtifactMap) -> Result<Value, StepError> {
        let overview = artifacts
            .get(STEP_OVERVIEW)
            .ok_or_else(|| StepError::fatal("overview missing from artifacts"))?;
        let expansion = artifacts
            .get(STEP_EXPAND)
            .ok_or_else(|| StepError::fatal("expansion missing from artifacts"))?;

        Ok(json!({
            "overview": overview,
            "details": expansion.get("details").cloned().unwrap_or(Value::Null),
            "failed_items": expansion.get("failed").cloned().unwrap_or(Value::Null),
        }))
    }

    async fn cleanup(&self, _artifacts: &mut ArtifactMap) {
        // Nothing local: both artifacts are plain JSON.
    }
}

/// Item references listed by an overview payload, under its `items` key.
fn item_refs(overview: &Value) -> Vec<String> {
    overview
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
