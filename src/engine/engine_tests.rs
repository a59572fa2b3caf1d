//! Scenario tests driving full engines through the poller façade.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use crate::budget::BudgetEntry;
use crate::config::{ConfigSource, DeviceSettings, PollerConfig, StaticConfigSource};
use crate::events::{LifecycleEvent, LifecycleListener};
use crate::persist::{CheckpointPhase, MemoryStore, StateStore, StorageRecord, StoreResult};
use crate::poller::Poller;
use crate::types::{ArtifactMap, CycleState, PollerId, PollerStats, StepId};
use crate::workflow::{StepContext, StepError, Workflow};

// ─── Fixtures ─────────────────────────────────────────────────────────────────

/// Planned outcome for one invocation of a step.
#[derive(Debug, Clone)]
enum StepPlan {
    Ok,
    Recoverable(&'static str),
    Fatal(&'static str),
}

/// A workflow whose steps follow a per-step script of outcomes (default:
/// succeed), recording every invocation and the artifact keys visible at
/// entry.
struct ScriptedWorkflow {
    steps: Vec<StepId>,
    script: Mutex<HashMap<String, VecDeque<StepPlan>>>,
    invocations: Arc<Mutex<Vec<String>>>,
    entry_artifacts: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ScriptedWorkflow {
    fn new(steps: &[&str]) -> Self {
        ScriptedWorkflow {
            steps: steps.iter().map(|s| StepId::new(*s)).collect(),
            script: Mutex::new(HashMap::new()),
            invocations: Arc::new(Mutex::new(Vec::new())),
            entry_artifacts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn plan(self, step: &str, plans: Vec<StepPlan>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(step.to_string(), plans.into());
        self
    }

    fn invocations(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.invocations)
    }

    fn entry_artifacts(&self) -> Arc<Mutex<Vec<Vec<String>>>> {
        Arc::clone(&self.entry_artifacts)
    }
}

#[async_trait]
impl Workflow for ScriptedWorkflow {
    fn name(&self) -> &str {
        "scripted"
    }

    fn steps(&self) -> &[StepId] {
        &self.steps
    }

    async fn run_step(&self, step: &StepId, cx: &mut StepContext<'_>) -> Result<(), StepError> {
        self.invocations
            .lock()
            .unwrap()
            .push(step.as_str().to_string());
        // Record which artifacts an invocation can see; cycle isolation
        // means a fresh cycle's first step sees none.
        let visible: Vec<String> = self
            .steps
            .iter()
            .filter(|s| cx.artifact(s.as_str()).is_some())
            .map(|s| s.as_str().to_string())
            .collect();
        self.entry_artifacts.lock().unwrap().push(visible);

        let plan = self
            .script
            .lock()
            .unwrap()
            .get_mut(step.as_str())
            .and_then(VecDeque::pop_front)
            .unwrap_or(StepPlan::Ok);

        match plan {
            StepPlan::Ok => {
                cx.store_artifact(step, json!(format!("{}-done", step)));
                Ok(())
            }
            StepPlan::Recoverable(message) => Err(StepError::recoverable(message)),
            StepPlan::Fatal(message) => Err(StepError::fatal(message)),
        }
    }

    fn assemble_report(&self, artifacts: &ArtifactMap) -> Result<Value, StepError> {
        Ok(json!({ "artifacts": artifacts }))
    }

    async fn cleanup(&self, _artifacts: &mut ArtifactMap) {}
}

/// Records event kinds in delivery order, plus the cycle number of every
/// report.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    report_cycles: Mutex<Vec<u64>>,
}

impl Recorder {
    fn kinds(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, kind: &str) -> usize {
        self.kinds().iter().filter(|k| *k == kind).count()
    }

    fn report_cycles(&self) -> Vec<u64> {
        self.report_cycles.lock().unwrap().clone()
    }
}

#[async_trait]
impl LifecycleListener for Recorder {
    async fn on_event(&self, event: &LifecycleEvent) -> Result<(), String> {
        self.events.lock().unwrap().push(event.kind().to_string());
        if let LifecycleEvent::Report { report, .. } = event {
            self.report_cycles.lock().unwrap().push(report.cycle_number);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "recorder"
    }
}

/// Store wrapper counting every call.
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    calls: AtomicU32,
}

impl CountingStore {
    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for CountingStore {
    async fn get(&self, key: &PollerId) -> StoreResult<Option<StorageRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn set(&self, key: &PollerId, record: &StorageRecord) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, record).await
    }

    async fn remove(&self, key: &PollerId) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(key).await
    }
}

fn test_config(interval: Duration) -> PollerConfig {
    let device = DeviceSettings {
        host: "gw.example".to_string(),
        port: 8443,
        username: "monitor".to_string(),
        password: "secret".to_string(),
    };
    PollerConfig::new(device, interval).with_workers(2)
}

fn source_with(config: PollerConfig) -> Arc<dyn ConfigSource> {
    Arc::new(StaticConfigSource::new(config))
}

/// Polls `probe` until it returns true or the timeout elapses.
async fn wait_for<F: Fn() -> bool>(probe: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    probe()
}

const WAIT: Duration = Duration::from_secs(5);

// ─── One-shot mode ────────────────────────────────────────────────────────────

#[tokio::test]
async fn one_shot_runs_once_and_never_touches_the_store() {
    let workflow = ScriptedWorkflow::new(&["collect", "transfer"]);
    let invocations = workflow.invocations();
    let recorder = Arc::new(Recorder::default());
    let store = Arc::new(CountingStore::default());

    let mut poller = Poller::one_shot(
        PollerId::new("demo-1"),
        Arc::new(workflow),
        source_with(test_config(Duration::from_secs(3600))),
    )
    .with_store(Arc::clone(&store) as Arc<dyn StateStore>);
    poller.subscribe(Arc::clone(&recorder) as Arc<dyn LifecycleListener>);

    poller.start().unwrap();
    let terminal = poller.wait_until_died().await;

    assert_eq!(terminal, None);
    // Despite the hour-long interval, a one-shot is due immediately.
    assert_eq!(*invocations.lock().unwrap(), vec!["collect", "transfer"]);
    assert_eq!(
        recorder.kinds(),
        vec!["started", "report", "completed", "died"]
    );
    assert_eq!(store.call_count(), 0);
}

#[tokio::test]
async fn one_shot_failure_dies_with_the_terminal_error() {
    let workflow = ScriptedWorkflow::new(&["collect"]).plan(
        "collect",
        vec![
            StepPlan::Recoverable("boom 1"),
            StepPlan::Recoverable("boom 2"),
            StepPlan::Recoverable("boom 3"),
        ],
    );
    let recorder = Arc::new(Recorder::default());

    let config = test_config(Duration::from_secs(3600))
        .with_budget("collect", BudgetEntry::new(2, Duration::from_millis(1)));
    let mut poller = Poller::one_shot(
        PollerId::new("demo-2"),
        Arc::new(workflow),
        source_with(config),
    );
    poller.subscribe(Arc::clone(&recorder) as Arc<dyn LifecycleListener>);

    poller.start().unwrap();
    let terminal = poller.wait_until_died().await;

    assert_eq!(terminal.as_deref(), Some("boom 3"));
    assert_eq!(recorder.kinds(), vec!["started", "died"]);
    assert_eq!(recorder.count("report"), 0);
}

// ─── Retry budgets ────────────────────────────────────────────────────────────

#[tokio::test]
async fn budgeted_retries_then_success_produces_one_report() {
    // The end-to-end retry scenario: maxAttempts=2, fixedDelay=10ms, the
    // step fails twice then succeeds.
    let workflow = ScriptedWorkflow::new(&["collect"]).plan(
        "collect",
        vec![
            StepPlan::Recoverable("transient 1"),
            StepPlan::Recoverable("transient 2"),
        ],
    );
    let recorder = Arc::new(Recorder::default());

    let config = test_config(Duration::from_secs(3600))
        .with_budget("collect", BudgetEntry::new(2, Duration::from_millis(10)));
    let mut poller = Poller::one_shot(
        PollerId::new("retry-1"),
        Arc::new(workflow),
        source_with(config),
    );
    poller.subscribe(Arc::clone(&recorder) as Arc<dyn LifecycleListener>);

    let started = Instant::now();
    poller.start().unwrap();
    let terminal = poller.wait_until_died().await;
    let elapsed = started.elapsed();

    assert_eq!(terminal, None);
    assert_eq!(recorder.count("report"), 1);
    assert!(
        elapsed >= Duration::from_millis(20),
        "two 10ms retry sleeps must have elapsed, got {:?}",
        elapsed
    );

    let info = poller.info();
    assert_eq!(info.stats.phase_attempts["collect"].retries, 2);
    assert_eq!(info.stats.phase_attempts["collect"].attempts, 3);
    assert_eq!(info.stats.cycles_completed, 1);
    assert_eq!(info.stats.cycles_failed, 0);
}

#[tokio::test]
async fn budget_exhaustion_fails_on_attempt_n_plus_one() {
    // maxAttempts = 2: attempts 1 and 2 fail and retry, attempt 3 fails and
    // escalates. The retry counter ends at exactly 2.
    let workflow = ScriptedWorkflow::new(&["collect"]).plan(
        "collect",
        vec![
            StepPlan::Recoverable("fail 1"),
            StepPlan::Recoverable("fail 2"),
            StepPlan::Recoverable("fail 3"),
            // Would succeed on a fourth attempt, which must never happen.
            StepPlan::Ok,
        ],
    );
    let invocations = workflow.invocations();

    let config = test_config(Duration::from_secs(3600))
        .with_budget("collect", BudgetEntry::new(2, Duration::from_millis(1)));
    let poller = Poller::one_shot(
        PollerId::new("retry-2"),
        Arc::new(workflow),
        source_with(config),
    );

    poller.start().unwrap();
    let terminal = poller.wait_until_died().await;

    assert_eq!(terminal.as_deref(), Some("fail 3"));
    assert_eq!(invocations.lock().unwrap().len(), 3);

    let info = poller.info();
    assert_eq!(info.stats.phase_attempts["collect"].attempts, 3);
    assert_eq!(info.stats.phase_attempts["collect"].retries, 2);
    assert_eq!(info.stats.cycles_failed, 1);
}

#[tokio::test]
async fn fatal_step_error_skips_the_retry_budget() {
    let workflow =
        ScriptedWorkflow::new(&["collect"]).plan("collect", vec![StepPlan::Fatal("broken")]);
    let invocations = workflow.invocations();

    let config = test_config(Duration::from_secs(3600))
        .with_budget("collect", BudgetEntry::new(5, Duration::from_millis(1)));
    let poller = Poller::one_shot(
        PollerId::new("fatal-1"),
        Arc::new(workflow),
        source_with(config),
    );

    poller.start().unwrap();
    let terminal = poller.wait_until_died().await;

    assert_eq!(terminal.as_deref(), Some("broken"));
    assert_eq!(invocations.lock().unwrap().len(), 1);
}

// ─── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_during_sleep_wins_the_race_and_skips_the_resumed_phase() {
    // One cycle runs immediately; the second is an hour away, so the engine
    // parks in SLEEP. Stopping must reach DIED long before that and never
    // run the second cycle's steps.
    let workflow = ScriptedWorkflow::new(&["collect"]);
    let invocations = workflow.invocations();
    let recorder = Arc::new(Recorder::default());

    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let mut poller = Poller::new(
        PollerId::new("cancel-1"),
        Arc::new(workflow),
        source_with(test_config(Duration::from_secs(3600))),
    )
    .with_store(store);
    poller.subscribe(Arc::clone(&recorder) as Arc<dyn LifecycleListener>);

    poller.start().unwrap();
    assert!(
        wait_for(|| poller.info().state == "sleep", WAIT).await,
        "engine should park in SLEEP after the first cycle"
    );
    let steps_before_stop = invocations.lock().unwrap().len();

    let stop_started = Instant::now();
    let terminal = poller.stop().await;
    let stop_elapsed = stop_started.elapsed();

    assert_eq!(terminal, None);
    assert!(
        stop_elapsed < Duration::from_secs(2),
        "stop must interrupt the hour-long sleep, took {:?}",
        stop_elapsed
    );
    // The phase SLEEP was waiting to resume never executed.
    assert_eq!(invocations.lock().unwrap().len(), steps_before_stop);

    let kinds = recorder.kinds();
    assert!(kinds.contains(&"disabling".to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some("died"));
    assert!(!poller.info().active);
}

#[tokio::test]
async fn stop_on_an_idle_poller_resolves_immediately() {
    let workflow = ScriptedWorkflow::new(&["collect"]);
    let poller = Poller::new(
        PollerId::new("idle-1"),
        Arc::new(workflow),
        source_with(test_config(Duration::from_secs(60))),
    );

    assert_eq!(poller.stop().await, None);
    assert_eq!(poller.wait_until_died().await, None);
}

#[tokio::test]
async fn start_while_active_is_rejected() {
    let workflow = ScriptedWorkflow::new(&["collect"]);
    let poller = Poller::new(
        PollerId::new("dup-1"),
        Arc::new(workflow),
        source_with(test_config(Duration::from_secs(3600))),
    );

    poller.start().unwrap();
    assert!(poller.start().is_err());
    poller.stop().await;

    // A died instance can be started again.
    poller.start().unwrap();
    poller.stop().await;
}

// ─── Restore ──────────────────────────────────────────────────────────────────

fn seeded_record(
    steps_with_artifacts: &[&str],
    checkpoint_step: &str,
    cycle_number: u64,
) -> StorageRecord {
    let mut cycle = CycleState::new(cycle_number);
    for step in steps_with_artifacts {
        cycle
            .artifacts
            .insert(step.to_string(), json!(format!("{}-done", step)));
    }
    StorageRecord::new(
        CheckpointPhase::Step {
            id: StepId::new(checkpoint_step),
        },
        Utc::now(),
        PollerStats::default(),
        cycle,
    )
}

#[tokio::test]
async fn restart_after_step_checkpoint_never_redoes_completed_steps() {
    // Crash simulated right after "collect" checkpointed with its artifact
    // present: the restarted engine resumes at "transfer".
    let id = PollerId::new("restore-1");
    let store = Arc::new(MemoryStore::new());
    store
        .set(&id, &seeded_record(&["collect"], "collect", 7))
        .await
        .unwrap();

    let workflow = ScriptedWorkflow::new(&["collect", "transfer"]);
    let invocations = workflow.invocations();
    let recorder = Arc::new(Recorder::default());

    let mut poller = Poller::new(
        id,
        Arc::new(workflow),
        source_with(test_config(Duration::from_secs(3600))),
    )
    .with_store(store as Arc<dyn StateStore>);
    poller.subscribe(Arc::clone(&recorder) as Arc<dyn LifecycleListener>);

    poller.start().unwrap();
    assert!(
        wait_for(|| recorder.count("report") >= 1, WAIT).await,
        "restored cycle should complete"
    );
    poller.stop().await;

    // The resumed cycle ran only the un-checkpointed step.
    let first_cycle_steps: Vec<_> = invocations.lock().unwrap().iter().take(1).cloned().collect();
    assert_eq!(first_cycle_steps, vec!["transfer"]);

    // The restored cycle number carried over into the report.
    assert!(poller.info().stats.cycles_completed >= 1);
    assert_eq!(recorder.report_cycles().first(), Some(&7));
}

#[tokio::test]
async fn restart_without_the_artifact_redoes_the_checkpointed_step() {
    // Crash simulated after the checkpoint write but with no artifact (the
    // step itself never finished): the step reruns.
    let id = PollerId::new("restore-2");
    let store = Arc::new(MemoryStore::new());
    store
        .set(&id, &seeded_record(&[], "collect", 3))
        .await
        .unwrap();

    let workflow = ScriptedWorkflow::new(&["collect", "transfer"]);
    let invocations = workflow.invocations();
    let recorder = Arc::new(Recorder::default());

    let mut poller = Poller::new(
        id,
        Arc::new(workflow),
        source_with(test_config(Duration::from_secs(3600))),
    )
    .with_store(store as Arc<dyn StateStore>);
    poller.subscribe(Arc::clone(&recorder) as Arc<dyn LifecycleListener>);

    poller.start().unwrap();
    assert!(wait_for(|| recorder.count("report") >= 1, WAIT).await);
    poller.stop().await;

    let first_two: Vec<_> = invocations.lock().unwrap().iter().take(2).cloned().collect();
    assert_eq!(first_two, vec!["collect", "transfer"]);
}

#[tokio::test]
async fn checkpoints_are_written_at_persistent_phase_exits() {
    let id = PollerId::new("persist-1");
    let store = Arc::new(MemoryStore::new());

    let workflow = ScriptedWorkflow::new(&["collect", "transfer"]);
    let recorder = Arc::new(Recorder::default());

    let mut poller = Poller::new(
        id.clone(),
        Arc::new(workflow),
        source_with(test_config(Duration::from_secs(3600))),
    )
    .with_store(Arc::clone(&store) as Arc<dyn StateStore>);
    poller.subscribe(Arc::clone(&recorder) as Arc<dyn LifecycleListener>);

    poller.start().unwrap();
    assert!(wait_for(|| recorder.count("completed") >= 1, WAIT).await);
    poller.stop().await;

    // After a completed cycle the cleanup checkpoint is the latest record.
    let record = store.get(&id).await.unwrap().expect("record must exist");
    assert_eq!(record.checkpoint, CheckpointPhase::Cleanup);
    assert!(record.stats.cycles_completed >= 1);
}

// ─── Cycle isolation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn consecutive_cycles_share_no_artifacts() {
    let workflow = ScriptedWorkflow::new(&["collect", "transfer"]);
    let entry_artifacts = workflow.entry_artifacts();
    let recorder = Arc::new(Recorder::default());

    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let mut poller = Poller::new(
        PollerId::new("isolation-1"),
        Arc::new(workflow),
        source_with(test_config(Duration::from_millis(20))),
    )
    .with_store(store);
    poller.subscribe(Arc::clone(&recorder) as Arc<dyn LifecycleListener>);

    poller.start().unwrap();
    assert!(
        wait_for(|| recorder.count("completed") >= 2, WAIT).await,
        "two cycles should complete"
    );
    poller.stop().await;

    let seen = entry_artifacts.lock().unwrap();
    // Steps alternate collect/transfer per cycle. Every "collect" entry (the
    // first step of a cycle) must see an empty artifact map; every
    // "transfer" entry sees exactly the collect artifact.
    for (i, visible) in seen.iter().enumerate() {
        if i % 2 == 0 {
            assert!(
                visible.is_empty(),
                "cycle-opening step saw leaked artifacts: {:?}",
                visible
            );
        } else {
            assert_eq!(visible, &vec!["collect".to_string()]);
        }
    }
}

// ─── Recurring failures ───────────────────────────────────────────────────────

#[tokio::test]
async fn recurring_engine_survives_a_failed_cycle() {
    // Cycle 1 exhausts the budget and fails; cycle 2 succeeds. The loop
    // keeps going and failures are visible in the stats.
    let workflow = ScriptedWorkflow::new(&["collect"]).plan(
        "collect",
        vec![StepPlan::Recoverable("bad day"), StepPlan::Recoverable("bad day")],
    );
    let recorder = Arc::new(Recorder::default());

    let config = test_config(Duration::from_millis(20))
        .with_budget("collect", BudgetEntry::new(1, Duration::from_millis(1)));
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let mut poller = Poller::new(
        PollerId::new("failover-1"),
        Arc::new(workflow),
        source_with(config),
    )
    .with_store(store);
    poller.subscribe(Arc::clone(&recorder) as Arc<dyn LifecycleListener>);

    poller.start().unwrap();
    assert!(
        wait_for(|| recorder.count("report") >= 1, WAIT).await,
        "a later cycle should succeed after the failed one"
    );
    poller.stop().await;

    let info = poller.info();
    assert_eq!(info.stats.cycles_failed, 1);
    assert!(info.stats.cycles_completed >= 1);
}
