//! The caller-facing poller instance.
//!
//! A [`Poller`] binds a workflow, a configuration source, and (for recurring
//! instances) a state store, and owns the engine task driving the state
//! machine. Once `start()` has resolved there is no synchronous exception
//! surface: failures are observed through the `died` lifecycle event or
//! through [`Poller::info`].

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ConfigSource;
use crate::engine::{EngineOptions, PollerEngine, PollerInfo, RunMode};
use crate::events::{LifecycleBus, LifecycleListener};
use crate::persist::StateStore;
use crate::types::PollerId;
use crate::workflow::Workflow;

/// Errors from the poller surface.
#[derive(Debug, Error)]
pub enum PollerError {
    /// `start()` was called while the engine task is still running.
    #[error("poller {0} is already active")]
    AlreadyActive(PollerId),
}

struct EngineHandle {
    cancel: CancellationToken,
    join: JoinHandle<Option<String>>,
}

/// One poller instance: a long-lived, cooperatively-cancellable polling
/// state machine, restartable after it dies.
pub struct Poller {
    id: PollerId,
    mode: RunMode,
    workflow: Arc<dyn Workflow>,
    store: Option<Arc<dyn StateStore>>,
    config_source: Arc<dyn ConfigSource>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    runtime: Mutex<Option<EngineHandle>>,
    info: Mutex<watch::Receiver<PollerInfo>>,
}

impl Poller {
    /// Creates a recurring poller.
    ///
    /// Recurring pollers should be given a store via [`Poller::with_store`];
    /// without one they run but lose progress on restart.
    pub fn new(
        id: PollerId,
        workflow: Arc<dyn Workflow>,
        config_source: Arc<dyn ConfigSource>,
    ) -> Self {
        let (_, info_rx) = watch::channel(PollerInfo::idle(id.clone()));
        Poller {
            id,
            mode: RunMode::Recurring,
            workflow,
            store: None,
            config_source,
            listeners: Vec::new(),
            runtime: Mutex::new(None),
            info: Mutex::new(info_rx),
        }
    }

    /// Creates a one-shot ("demo") poller: due immediately, never persisted,
    /// dead after a single cycle.
    pub fn one_shot(
        id: PollerId,
        workflow: Arc<dyn Workflow>,
        config_source: Arc<dyn ConfigSource>,
    ) -> Self {
        let mut poller = Poller::new(id, workflow, config_source);
        poller.mode = RunMode::OneShot;
        poller
    }

    /// Attaches a durable store for checkpoints. Ignored by one-shot
    /// instances, which never touch persistence.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Registers a lifecycle listener. Must happen before `start()`;
    /// listeners observe events in registration order.
    pub fn subscribe(&mut self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.push(listener);
    }

    /// The instance id.
    pub fn id(&self) -> &PollerId {
        &self.id
    }

    /// The run mode.
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Returns true while the engine task is running.
    pub fn is_active(&self) -> bool {
        self.runtime
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|handle| !handle.join.is_finished())
    }

    /// Starts the engine.
    ///
    /// # Errors
    ///
    /// Returns [`PollerError::AlreadyActive`] if the engine task from a
    /// previous `start()` is still running. A died instance may be started
    /// again.
    pub fn start(&self) -> Result<(), PollerError> {
        let mut runtime = self.runtime.lock().unwrap();
        if runtime
            .as_ref()
            .is_some_and(|handle| !handle.join.is_finished())
        {
            return Err(PollerError::AlreadyActive(self.id.clone()));
        }

        let (info_tx, info_rx) = watch::channel(PollerInfo::idle(self.id.clone()));
        *self.info.lock().unwrap() = info_rx;

        let mut bus = LifecycleBus::new();
        for listener in &self.listeners {
            bus.subscribe(Arc::clone(listener));
        }

        let cancel = CancellationToken::new();
        let store = if self.mode.is_one_shot() {
            None
        } else {
            self.store.clone()
        };
        let engine = PollerEngine::new(
            EngineOptions {
                id: self.id.clone(),
                mode: self.mode,
                workflow: Arc::clone(&self.workflow),
                store,
                config_source: Arc::clone(&self.config_source),
                bus,
            },
            cancel.clone(),
            info_tx,
        );

        debug!(poller = %self.id, mode = ?self.mode, "Starting engine task");
        let join = tokio::spawn(engine.run());
        *runtime = Some(EngineHandle { cancel, join });
        Ok(())
    }

    /// Stops the engine and waits until it has fully died.
    ///
    /// Returns the terminal error, if the engine died failing. Stopping an
    /// idle instance resolves immediately with `None`.
    pub async fn stop(&self) -> Option<String> {
        let handle = self.runtime.lock().unwrap().take();
        let Some(handle) = handle else {
            return None;
        };

        handle.cancel.cancel();
        match handle.join.await {
            Ok(terminal_error) => terminal_error,
            Err(e) => Some(format!("engine task aborted: {}", e)),
        }
    }

    /// Current snapshot: state, stats, next-fire time, last error.
    pub fn info(&self) -> PollerInfo {
        self.info.lock().unwrap().borrow().clone()
    }

    /// Waits until the engine reaches DIED on its own (useful for one-shot
    /// instances). Returns the terminal error, if any.
    pub async fn wait_until_died(&self) -> Option<String> {
        let mut rx = self.info.lock().unwrap().clone();
        // Never started: nothing will ever publish, resolve immediately.
        if rx.borrow().state == "uninitialized" && self.runtime.lock().unwrap().is_none() {
            return None;
        }
        // The engine publishes `active = false` exactly once, at DIED.
        loop {
            {
                let snapshot = rx.borrow();
                if !snapshot.active && snapshot.state == "died" {
                    return snapshot.last_error.clone();
                }
            }
            if rx.changed().await.is_err() {
                let snapshot = rx.borrow();
                return snapshot.last_error.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Behavioral coverage for start/stop/info lives in
    // `engine::engine_tests`, which drives real workflows through the
    // façade.
    #[test]
    fn poller_error_formats_instance_id() {
        let err = PollerError::AlreadyActive(PollerId::new("gw-7"));
        assert_eq!(err.to_string(), "poller gw-7 is already active");
    }
}
