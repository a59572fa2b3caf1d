//! The poller engine driver.
//!
//! One engine instance drives one logical control task through the state
//! machine in [`super::transitions`]: initialize or restore, wait for the
//! schedule, run the workflow's collect steps (checkpointing after each),
//! report the result, clean up, loop or die. Every phase body is wrapped so
//! an escaping error becomes a FAILED transition, never a process crash.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::restore::plan_resume;
use super::state::{EngineState, PollerInfo, RunMode};
use super::transitions::{StateOutcome, TransitionContext, next_state};
use crate::budget::{RetryBudget, RetryDecision};
use crate::config::{ConfigCache, ConfigSource, PollerConfig};
use crate::events::{LifecycleBus, LifecycleEvent};
use crate::persist::{CheckpointPhase, StateStore, StorageRecord};
use crate::scheduler::TaskScheduler;
use crate::types::{CycleReport, CycleState, PollerId, PollerStats};
use crate::workflow::{StepContext, StepError, Workflow};

/// Past-due window used while configuration is not yet available during
/// restore. Only affects whether a restored schedule checkpoint is reused or
/// recomputed.
const FALLBACK_PAST_DUE_WINDOW: Duration = Duration::from_secs(3600);

/// Everything needed to build an engine instance.
pub(crate) struct EngineOptions {
    /// Stable instance id; also the persistence key.
    pub id: PollerId,
    /// Recurring or one-shot.
    pub mode: RunMode,
    /// The work portion of each cycle.
    pub workflow: Arc<dyn Workflow>,
    /// Durable store; `None` disables persistence (one-shot engines never
    /// call it regardless).
    pub store: Option<Arc<dyn StateStore>>,
    /// Configuration provider, fetched lazily.
    pub config_source: Arc<dyn ConfigSource>,
    /// Lifecycle listeners, already subscribed in delivery order.
    pub bus: LifecycleBus,
}

/// The state machine driver for one poller instance.
pub(crate) struct PollerEngine {
    id: PollerId,
    mode: RunMode,
    workflow: Arc<dyn Workflow>,
    store: Option<Arc<dyn StateStore>>,
    config: ConfigCache,
    bus: LifecycleBus,
    cancel: CancellationToken,
    info_tx: watch::Sender<PollerInfo>,

    stats: PollerStats,
    cycle: Option<CycleState>,
    next_execution: Option<DateTime<Utc>>,
    scheduler: Option<TaskScheduler<Value>>,
    budget: Option<RetryBudget>,
    restored: Option<StorageRecord>,
    // Error that routed the current cycle toward FAILED.
    pending_error: Option<String>,
    // Error carried into the `died` event.
    terminal_error: Option<String>,
}

impl PollerEngine {
    /// Builds an engine bound to a cancellation token and an info channel.
    pub(crate) fn new(
        options: EngineOptions,
        cancel: CancellationToken,
        info_tx: watch::Sender<PollerInfo>,
    ) -> Self {
        let config = ConfigCache::new(options.id.clone(), options.config_source);
        PollerEngine {
            id: options.id,
            mode: options.mode,
            workflow: options.workflow,
            store: options.store,
            config,
            bus: options.bus,
            cancel,
            info_tx,
            stats: PollerStats::default(),
            cycle: None,
            next_execution: None,
            scheduler: None,
            budget: None,
            restored: None,
            pending_error: None,
            terminal_error: None,
        }
    }

    /// Drives the state machine until DIED. Returns the terminal error, if
    /// the engine died failing.
    #[instrument(skip(self), fields(poller = %self.id, mode = ?self.mode))]
    pub(crate) async fn run(mut self) -> Option<String> {
        info!("Engine starting");
        self.bus
            .emit(&LifecycleEvent::Started {
                poller: self.id.clone(),
            })
            .await;

        let mut state = EngineState::Initialized;
        loop {
            self.publish_info(&state, true);

            // Level-triggered disable check at every interruptible state
            // entry; the state body does not run once the flag is set.
            let outcome = if self.cancel.is_cancelled() && state.is_interruptible() {
                debug!(state = state.name(), "Cancellation observed at state entry");
                StateOutcome::Interrupted
            } else {
                self.execute(&state).await
            };

            // A persistent phase's checkpoint is durably written before the
            // next phase begins; that ordering is what makes restore safe.
            if outcome == StateOutcome::Advance && state.persists_on_exit() {
                self.checkpoint_for(&state).await;
            }

            let ctx = TransitionContext {
                step_count: self.workflow.steps().len(),
                mode: self.mode,
                disabled: self.cancel.is_cancelled(),
            };
            state = match next_state(&state, outcome, &ctx) {
                Ok(next) => next,
                Err(e) => {
                    // Driver bug; treat as a fatal engine error.
                    error!(error = %e, "Invalid engine transition");
                    self.pending_error = Some(e.to_string());
                    EngineState::Cleanup {
                        next: Box::new(EngineState::Failed),
                    }
                }
            };

            if state.is_terminal() {
                break;
            }
        }

        self.die().await
    }

    async fn execute(&mut self, state: &EngineState) -> StateOutcome {
        match state {
            // Neither appears inside the loop: the driver starts at
            // INITIALIZED and breaks before executing DIED.
            EngineState::Uninitialized | EngineState::Died => StateOutcome::Advance,
            EngineState::Initialized => self.do_initialize().await,
            EngineState::Restore => self.do_restore().await,
            EngineState::Prepare => self.do_prepare(),
            EngineState::Schedule => self.do_schedule().await,
            EngineState::ScheduleCheck => self.do_schedule_check(),
            EngineState::Sleep { wait, .. } => self.do_sleep(*wait).await,
            EngineState::Step(index) => self.do_step(*index).await,
            EngineState::Process => self.do_process().await,
            EngineState::Completed => self.do_completed().await,
            EngineState::Failed => self.do_failed().await,
            EngineState::Disabled => self.do_disabled().await,
            EngineState::Cleanup { .. } => self.do_cleanup().await,
        }
    }

    // ─── State bodies ─────────────────────────────────────────────────────────

    /// INITIALIZED: load the persisted record, if any.
    async fn do_initialize(&mut self) -> StateOutcome {
        if self.mode.is_one_shot() {
            return StateOutcome::Advance;
        }
        let Some(store) = self.store.clone() else {
            return StateOutcome::Advance;
        };

        match store.get(&self.id).await {
            Ok(Some(record)) => {
                debug!(
                    checkpoint = record.checkpoint.name(),
                    cycle = record.cycle.cycle_number,
                    "Persisted record found, restoring"
                );
                self.stats = record.stats.clone();
                self.next_execution = Some(record.schedule.next_execution);
                self.cycle = Some(record.cycle.clone());
                self.restored = Some(record);
                StateOutcome::ResumeAt(EngineState::Restore)
            }
            Ok(None) => StateOutcome::Advance,
            Err(e) => {
                // Accepted degradation: an unreadable record means lost
                // progress, not a dead poller.
                warn!(error = %e, "Failed to load persisted record, starting fresh");
                StateOutcome::Advance
            }
        }
    }

    /// RESTORE: map the loaded record to a resume state.
    async fn do_restore(&mut self) -> StateOutcome {
        let Some(record) = self.restored.take() else {
            self.pending_error = Some("restore entered without a loaded record".to_string());
            return StateOutcome::Fatal;
        };

        let window = match self.config.get().await {
            Ok(config) => {
                self.note_config(&config);
                config.schedule.effective_past_due_window()
            }
            Err(e) => {
                warn!(error = %e, "Configuration unavailable during restore, using fallback window");
                FALLBACK_PAST_DUE_WINDOW
            }
        };

        let plan = plan_resume(&record, self.workflow.as_ref(), Utc::now(), window);
        if let Some(cycle) = self.cycle.as_mut() {
            for key in &plan.drop_artifacts {
                cycle.artifacts.remove(key);
            }
        }

        info!(resume = plan.resume.name(), "Restored from checkpoint");
        StateOutcome::ResumeAt(plan.resume)
    }

    /// PREPARE: allocate a fresh cycle.
    fn do_prepare(&mut self) -> StateOutcome {
        let next_number = self.cycle.as_ref().map(|c| c.cycle_number).unwrap_or(0) + 1;
        self.cycle = Some(CycleState::new(next_number));
        self.stats.cycles_started += 1;
        self.pending_error = None;
        debug!(cycle = next_number, "Cycle prepared");
        StateOutcome::Advance
    }

    /// SCHEDULE: compute the next execution time from interval + last time.
    async fn do_schedule(&mut self) -> StateOutcome {
        let now = Utc::now();
        if self.mode.is_one_shot() {
            self.next_execution = Some(now);
            return StateOutcome::Advance;
        }

        let config = match self.config.get().await {
            Ok(config) => config,
            Err(e) => return self.recoverable_failure("schedule", e.to_string()),
        };
        self.note_config(&config);

        let interval = match chrono::Duration::from_std(config.schedule.interval) {
            Ok(interval) => interval,
            Err(_) => {
                self.pending_error = Some("polling interval out of range".to_string());
                return StateOutcome::Fatal;
            }
        };

        let next = match self.next_execution {
            // Advance from the previous due time; if the cycle overran the
            // interval, fire immediately instead of drifting into the past.
            Some(previous) => previous
                .checked_add_signed(interval)
                .filter(|computed| *computed > now)
                .unwrap_or(now),
            None => now,
        };

        debug!(next_execution = %next, "Schedule computed");
        self.next_execution = Some(next);
        StateOutcome::Advance
    }

    /// SCHEDULE_CHECK: compare now against the next execution time.
    fn do_schedule_check(&mut self) -> StateOutcome {
        if self.mode.is_one_shot() {
            return StateOutcome::Due;
        }
        let Some(next) = self.next_execution else {
            self.pending_error = Some("schedule check without a computed time".to_string());
            return StateOutcome::Fatal;
        };

        let now = Utc::now();
        if now >= next {
            StateOutcome::Due
        } else {
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            StateOutcome::NotDue { wait }
        }
    }

    /// SLEEP: the timer races the edge-triggered cancellation notification,
    /// so an in-progress wait is interrupted promptly.
    async fn do_sleep(&mut self, wait: Duration) -> StateOutcome {
        tokio::select! {
            _ = self.cancel.cancelled() => StateOutcome::Interrupted,
            _ = tokio::time::sleep(wait) => StateOutcome::Advance,
        }
    }

    /// COLLECT step `index`: run one workflow step.
    async fn do_step(&mut self, index: usize) -> StateOutcome {
        let Some(step) = self.workflow.steps().get(index).cloned() else {
            self.pending_error = Some(format!("collect step index {} out of range", index));
            return StateOutcome::Fatal;
        };
        self.stats.record_attempt(step.as_str());

        // First use of the configuration for this cycle; errors surface here
        // as recoverable phase errors under this step's budget.
        let config = match self.config.get().await {
            Ok(config) => config,
            Err(e) => return self.recoverable_failure(step.as_str(), e.to_string()),
        };
        self.note_config(&config);
        if self.scheduler.is_none() {
            self.scheduler = Some(TaskScheduler::new(
                format!("{}/{}", self.id, self.workflow.name()),
                config.workers,
            ));
        }

        let result = {
            let Some(scheduler) = self.scheduler.as_ref() else {
                self.pending_error = Some("task scheduler missing".to_string());
                return StateOutcome::Fatal;
            };
            let Some(cycle) = self.cycle.as_mut() else {
                self.pending_error = Some("collect step without an active cycle".to_string());
                return StateOutcome::Fatal;
            };
            if cycle.started_at.is_none() {
                cycle.started_at = Some(Utc::now());
            }

            let mut cx =
                StepContext::new(&mut cycle.artifacts, scheduler, &self.config, &self.cancel);
            let workflow = Arc::clone(&self.workflow);
            AssertUnwindSafe(workflow.run_step(&step, &mut cx))
                .catch_unwind()
                .await
        };

        match result {
            Ok(Ok(())) => {
                // The artifact is the resumption cursor; a step that
                // "succeeded" without writing one would make restore redo or
                // skip work unpredictably.
                let wrote_artifact = self
                    .cycle
                    .as_ref()
                    .is_some_and(|c| c.artifacts.contains_key(step.as_str()));
                if !wrote_artifact {
                    self.pending_error =
                        Some(format!("step '{}' completed without writing its artifact", step));
                    return StateOutcome::Fatal;
                }
                debug!(step = %step, "Collect step finished");
                StateOutcome::Advance
            }
            Ok(Err(StepError::Recoverable(message))) => {
                self.recoverable_failure(step.as_str(), message)
            }
            Ok(Err(StepError::Fatal(message))) => {
                self.pending_error = Some(message);
                StateOutcome::Fatal
            }
            Err(_) => {
                self.pending_error = Some(format!("step '{}' panicked", step));
                StateOutcome::Fatal
            }
        }
    }

    /// PROCESS: assemble the report and hand it to the caller.
    async fn do_process(&mut self) -> StateOutcome {
        let report = {
            let Some(cycle) = self.cycle.as_ref() else {
                self.pending_error = Some("process without an active cycle".to_string());
                return StateOutcome::Fatal;
            };

            let assembled = std::panic::catch_unwind(AssertUnwindSafe(|| {
                self.workflow.assemble_report(&cycle.artifacts)
            }));
            match assembled {
                Ok(Ok(collected)) => CycleReport {
                    cycle_number: cycle.cycle_number,
                    collected,
                    cycle_start: cycle.started_at.unwrap_or_else(Utc::now),
                    cycle_end: Utc::now(),
                },
                Ok(Err(e)) => {
                    self.pending_error = Some(format!("report assembly failed: {}", e));
                    return StateOutcome::Fatal;
                }
                Err(_) => {
                    self.pending_error = Some("report assembly panicked".to_string());
                    return StateOutcome::Fatal;
                }
            }
        };

        // Listener errors are the bus's problem, never the loop's.
        self.bus
            .emit(&LifecycleEvent::Report {
                poller: self.id.clone(),
                report,
            })
            .await;

        if let Some(cycle) = self.cycle.as_mut() {
            cycle.succeeded = true;
        }
        StateOutcome::Advance
    }

    /// COMPLETED: promote the cycle into the stats and emit `completed`.
    async fn do_completed(&mut self) -> StateOutcome {
        self.stats.cycles_completed += 1;
        let cycle_number = self
            .cycle
            .as_mut()
            .map(|cycle| {
                cycle.complete();
                cycle.cycle_number
            })
            .unwrap_or(0);

        info!(cycle = cycle_number, "Cycle completed");
        self.bus
            .emit(&LifecycleEvent::Completed {
                poller: self.id.clone(),
                cycle_number,
            })
            .await;
        StateOutcome::Advance
    }

    /// FAILED: convert the pending error into the cycle's terminal error.
    ///
    /// A failure inside this handler is itself fatal and forces an
    /// unconditional reschedule, logged but not retried.
    async fn do_failed(&mut self) -> StateOutcome {
        let body = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let error = self
                .pending_error
                .take()
                .unwrap_or_else(|| "unknown failure".to_string());
            error!(cycle_error = %error, "Cycle failed");

            self.stats.cycles_failed += 1;
            if let Some(cycle) = self.cycle.as_mut() {
                cycle.fail(error.clone());
            }
            if self.mode.is_one_shot() || self.cancel.is_cancelled() {
                self.terminal_error = Some(error);
            }
        }));

        match body {
            Ok(()) => StateOutcome::Advance,
            Err(_) => {
                error!("Failure handler itself failed, forcing reschedule");
                StateOutcome::HandlerFailed
            }
        }
    }

    /// DISABLED: announce the teardown.
    async fn do_disabled(&mut self) -> StateOutcome {
        info!("Disable signal observed, tearing down");
        self.bus
            .emit(&LifecycleEvent::Disabling {
                poller: self.id.clone(),
            })
            .await;
        StateOutcome::Advance
    }

    /// CLEANUP: release local artifacts and drop the cached configuration.
    async fn do_cleanup(&mut self) -> StateOutcome {
        if let Some(cycle) = self.cycle.as_mut() {
            let workflow = Arc::clone(&self.workflow);
            if AssertUnwindSafe(workflow.cleanup(&mut cycle.artifacts))
                .catch_unwind()
                .await
                .is_err()
            {
                warn!("Workflow cleanup panicked");
            }
            cycle.artifacts.clear();
        }

        self.config.invalidate().await;
        self.budget = None;
        StateOutcome::Advance
    }

    /// DIED: emit the terminal event and stop the scheduler.
    async fn die(mut self) -> Option<String> {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown().await;
        }

        self.bus
            .emit(&LifecycleEvent::Died {
                poller: self.id.clone(),
                error: self.terminal_error.clone(),
            })
            .await;

        self.publish_info(&EngineState::Died, false);
        info!(error = ?self.terminal_error, "Engine died");
        self.terminal_error
    }

    // ─── Helpers ──────────────────────────────────────────────────────────────

    /// Routes a recoverable phase failure through the retry budget.
    fn recoverable_failure(&mut self, phase: &str, message: String) -> StateOutcome {
        let budget = self.budget.clone().unwrap_or_default();
        let attempts = self
            .cycle
            .as_ref()
            .map(|c| c.retries_for(phase))
            .unwrap_or(0);

        match budget.decide(phase, attempts) {
            RetryDecision::Retry { delay } => {
                if let Some(cycle) = self.cycle.as_mut() {
                    cycle.bump_retry(phase);
                }
                self.stats.record_retry(phase);
                warn!(
                    phase,
                    retry = attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Phase failed, retrying"
                );
                StateOutcome::RetryAfter { delay }
            }
            RetryDecision::GiveUp => {
                warn!(phase, error = %message, "Phase failed, retry budget exhausted");
                self.pending_error = Some(message);
                StateOutcome::Exhausted
            }
        }
    }

    /// Caches policy derived from a fetched configuration.
    fn note_config(&mut self, config: &PollerConfig) {
        if self.budget.is_none() {
            self.budget = Some(config.retry_budget());
        }
    }

    /// Best-effort checkpoint at a persistent phase exit.
    async fn checkpoint_for(&mut self, state: &EngineState) {
        if self.mode.is_one_shot() {
            return;
        }
        let Some(store) = &self.store else { return };
        let Some(cycle) = &self.cycle else { return };

        let phase = match state {
            EngineState::Schedule => CheckpointPhase::Schedule,
            EngineState::Step(index) => {
                let Some(step) = self.workflow.steps().get(*index) else {
                    return;
                };
                CheckpointPhase::Step { id: step.clone() }
            }
            EngineState::Cleanup { .. } => CheckpointPhase::Cleanup,
            _ => return,
        };

        let next = self.next_execution.unwrap_or_else(Utc::now);
        let record = StorageRecord::new(phase, next, self.stats.clone(), cycle.clone());
        if let Err(e) = store.set(&self.id, &record).await {
            // Best-effort persistence: a failing checkpoint degrades restore,
            // it does not fail the running cycle.
            warn!(error = %e, "Checkpoint write failed, continuing");
        }
    }

    /// Publishes a fresh snapshot through the watch channel.
    fn publish_info(&self, state: &EngineState, active: bool) {
        let current_step = match state {
            EngineState::Step(index) => self
                .workflow
                .steps()
                .get(*index)
                .map(|s| s.as_str().to_string()),
            _ => None,
        };

        let last_error = self
            .terminal_error
            .clone()
            .or_else(|| self.cycle.as_ref().and_then(|c| c.last_error.clone()));

        let info = PollerInfo {
            id: self.id.clone(),
            state: state.name(),
            current_step,
            cycle_number: self.cycle.as_ref().map(|c| c.cycle_number).unwrap_or(0),
            stats: self.stats.clone(),
            next_execution: self.next_execution,
            last_error,
            active,
        };
        let _ = self.info_tx.send(info);
    }
}
