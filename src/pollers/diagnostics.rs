//! Device diagnostics poller.
//!
//! One cycle: ask the device for a diagnostics archive (landing in a local
//! work directory), transfer the archive to the remote analysis service,
//! wait for the service to process it, then fetch the finished analysis as
//! the cycle's report. The local archive is deleted at cleanup on every exit
//! path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::budget::retry_with_backoff;
use crate::device::{AnalysisStatus, DeviceClient, DeviceError};
use crate::scheduler::{TaskError, TaskPriority};
use crate::types::{ArtifactMap, StepId};
use crate::workflow::{StepContext, StepError, Workflow};

const STEP_COLLECT: &str = "collect";
const STEP_TRANSFER: &str = "transfer";
const STEP_AWAIT: &str = "await_analysis";
const STEP_FETCH: &str = "fetch_result";

/// Transient-error retries applied inside each remote task before the task
/// is considered failed (orthogonal to the phase retry budget).
const TASK_ATTEMPTS: u32 = 3;
const TASK_RETRY_DELAY: Duration = Duration::from_secs(2);

/// How long the await step polls the analysis service within one attempt.
const STATUS_ATTEMPTS: u32 = 10;
const STATUS_DELAY: Duration = Duration::from_secs(15);

/// The diagnostics collection workflow.
pub struct DiagnosticsWorkflow {
    client: Arc<dyn DeviceClient>,
    work_dir: PathBuf,
    steps: Vec<StepId>,
    status_attempts: u32,
    status_delay: Duration,
    task_attempts: u32,
    task_retry_delay: Duration,
}

impl DiagnosticsWorkflow {
    /// Creates the workflow. Archives land in `work_dir`.
    pub fn new(client: Arc<dyn DeviceClient>, work_dir: impl Into<PathBuf>) -> Self {
        DiagnosticsWorkflow {
            client,
            work_dir: work_dir.into(),
            steps: vec![
                StepId::new(STEP_COLLECT),
                StepId::new(STEP_TRANSFER),
                StepId::new(STEP_AWAIT),
                StepId::new(STEP_FETCH),
            ],
            status_attempts: STATUS_ATTEMPTS,
            status_delay: STATUS_DELAY,
            task_attempts: TASK_ATTEMPTS,
            task_retry_delay: TASK_RETRY_DELAY,
        }
    }

    /// Overrides the analysis status polling cadence.
    pub fn with_status_poll(mut self, attempts: u32, delay: Duration) -> Self {
        self.status_attempts = attempts;
        self.status_delay = delay;
        self
    }

    /// Overrides the task-internal transient retry cadence.
    pub fn with_task_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.task_attempts = attempts;
        self.task_retry_delay = delay;
        self
    }

    async fn run_collect(&self, step: &StepId, cx: &mut StepContext<'_>) -> Result<(), StepError> {
        let config = cx.config().await?;
        let client = Arc::clone(&self.client);
        let device = config.device.clone();
        let work_dir = self.work_dir.clone();
        let (attempts, delay) = (self.task_attempts, self.task_retry_delay);

        let handle = cx.scheduler().submit(
            "diagnostics/collect",
            TaskPriority::High,
            async move {
                retry_with_backoff(attempts, delay, DeviceError::is_transient, || {
                    let client = Arc::clone(&client);
                    let device = device.clone();
                    let work_dir = work_dir.clone();
                    async move { client.collect_archive(&device, &work_dir).await }
                })
                .await
                .into_result()
                .map(|path| json!(path.to_string_lossy()))
                .map_err(|e| TaskError::failed(e.to_string()))
            },
        );

        let path = handle.join().await?;
        debug!(archive = %path, "Diagnostics archive collected");
        cx.store_artifact(step, path);
        Ok(())
    }

    async fn run_transfer(&self, step: &StepId, cx: &mut StepContext<'_>) -> Result<(), StepError> {
        let config = cx.config().await?;
        let service = config
            .remote_service
            .clone()
            .ok_or_else(|| StepError::recoverable("remote analysis service not configured"))?;
        let archive = artifact_path(cx.require_artifact(STEP_COLLECT)?)?;

        let client = Arc::clone(&self.client);
        let (attempts, delay) = (self.task_attempts, self.task_retry_delay);
        let handle = cx.scheduler().submit(
            "diagnostics/transfer",
            TaskPriority::High,
            async move {
                retry_with_backoff(attempts, delay, DeviceError::is_transient, || {
                    let client = Arc::clone(&client);
                    let service = service.clone();
                    let archive = archive.clone();
                    async move { client.upload_archive(&service, &archive).await }
                })
                .await
                .into_result()
                .map(|remote| json!(remote))
                .map_err(|e| TaskError::failed(e.to_string()))
            },
        );

        let remote = handle.join().await?;
        debug!(handle = %remote, "Archive transferred for analysis");
        cx.store_artifact(step, remote);
        Ok(())
    }

    async fn run_await(&self, step: &StepId, cx: &mut StepContext<'_>) -> Result<(), StepError> {
        let config = cx.config().await?;
        let service = config
            .remote_service
            .clone()
            .ok_or_else(|| StepError::recoverable("remote analysis service not configured"))?;
        let remote = artifact_string(cx.require_artifact(STEP_TRANSFER)?)?;

        let client = Arc::clone(&self.client);
        let (attempts, delay) = (self.status_attempts.max(1), self.status_delay);
        let handle = cx.scheduler().submit(
            "diagnostics/await",
            TaskPriority::High,
            async move {
                let mut attempt = 0;
                loop {
                    match client.analysis_status(&service, &remote).await {
                        Ok(AnalysisStatus::Ready) => break Ok(json!({ "status": "ready" })),
                        Ok(AnalysisStatus::Failed(reason)) => {
                            break Err(TaskError::failed(format!("analysis failed: {}", reason)));
                        }
                        Ok(AnalysisStatus::Pending) => {
                            attempt += 1;
                            if attempt >= attempts {
                                break Err(TaskError::failed("analysis not ready in time"));
                            }
                            tokio::time::sleep(delay).await;
                        }
                        Err(e) if e.is_transient() => {
                            attempt += 1;
                            if attempt >= attempts {
                                break Err(TaskError::failed(e.to_string()));
                            }
                            tokio::time::sleep(delay).await;
                        }
                        Err(e) => break Err(TaskError::failed(e.to_string())),
                    }
                }
            },
        );

        let status = handle.join().await?;
        cx.store_artifact(step, status);
        Ok(())
    }

    async fn run_fetch(&self, step: &StepId, cx: &mut StepContext<'_>) -> Result<(), StepError> {
        let config = cx.config().await?;
        let service = config
            .remote_service
            .clone()
            .ok_or_else(|| StepError::recoverable("remote analysis service not configured"))?;
        let remote = artifact_string(cx.require_artifact(STEP_TRANSFER)?)?;

        let client = Arc::clone(&self.client);
        let (attempts, delay) = (self.task_attempts, self.task_retry_delay);
        let handle = cx.scheduler().submit(
            "diagnostics/fetch",
            TaskPriority::High,
            async move {
                retry_with_backoff(attempts, delay, DeviceError::is_transient, || {
                    let client = Arc::clone(&client);
                    let service = service.clone();
                    let remote = remote.clone();
                    async move { client.fetch_analysis(&service, &remote).await }
                })
                .await
                .into_result()
                .map_err(|e| TaskError::failed(e.to_string()))
            },
        );

        let analysis = handle.join().await?;
        cx.store_artifact(step, analysis);
        Ok(())
    }
}

#[async_trait]
impl Workflow for DiagnosticsWorkflow {
    fn name(&self) -> &str {
        "diagnostics"
    }

    fn steps(&self) -> &[StepId] {
        &self.steps
    }

    async fn run_step(&self, step: &StepId, cx: &mut StepContext<'_>) -> Result<(), StepError> {
        match step.as_str() {
            STEP_COLLECT => self.run_collect(step, cx).await,
            STEP_TRANSFER => self.run_transfer(step, cx).await,
            STEP_AWAIT => self.run_await(step, cx).await,
            STEP_FETCH => self.run_fetch(step, cx).await,
            other => Err(StepError::fatal(format!("unknown step '{}'", other))),
        }
    }

    fn assemble_report(&self, artifacts: &ArtifactMap) -> Result<Value, StepError> {
        let analysis = artifacts
            .get(STEP_FETCH)
            .ok_or_else(|| StepError::fatal("analysis result missing from artifacts"))?;
        Ok(json!({ "analysis": analysis }))
    }

    async fn cleanup(&self, artifacts: &mut ArtifactMap) {
        let Some(path) = artifacts.get(STEP_COLLECT).and_then(Value::as_str) else {
            return;
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(archive = %path, "Local archive removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(archive = %path, error = %e, "Failed to remove local archive"),
        }
    }

    /// The collect artifact is a local path; it only proves the step
    /// completed while the file still exists.
    fn artifact_is_valid(&self, step: &StepId, artifact: &Value) -> bool {
        if step.as_str() != STEP_COLLECT {
            return true;
        }
        artifact
            .as_str()
            .is_some_and(|path| Path::new(path).exists())
    }
}

fn artifact_string(value: &Value) -> Result<String, StepError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| StepError::fatal("artifact is not a string"))
}

fn artifact_path(value: &Value) -> Result<PathBuf, StepError> {
    artifact_string(value).map(PathBuf::from)
}
