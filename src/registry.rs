//! Registry of live poller instances.
//!
//! An explicit object owned by whichever component composes pollers (no
//! module-level global): created at service start, torn down at service
//! stop. Persistent instances are registered by id; one-shot instances go
//! into a separate ephemeral list so enumeration can include or skip them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::poller::Poller;
use crate::types::PollerId;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An instance with this id is already registered.
    #[error("poller {0} is already registered")]
    Duplicate(PollerId),

    /// No instance with this id is registered.
    #[error("poller {0} is not registered")]
    NotFound(PollerId),
}

/// Owns the set of live poller instances.
#[derive(Default)]
pub struct PollerRegistry {
    pollers: Mutex<HashMap<PollerId, Arc<Poller>>>,
    ephemeral: Mutex<Vec<Arc<Poller>>>,
}

impl PollerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        PollerRegistry::default()
    }

    /// Registers a persistent instance under its id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if the id is taken — two
    /// instances sharing an id would clobber each other's checkpoints.
    pub fn register(&self, poller: Arc<Poller>) -> Result<(), RegistryError> {
        let mut pollers = self.pollers.lock().unwrap();
        let id = poller.id().clone();
        if pollers.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        debug!(poller = %id, "Poller registered");
        pollers.insert(id, poller);
        Ok(())
    }

    /// Tracks a one-shot instance. Finished one-shots are pruned lazily on
    /// the next enumeration.
    pub fn register_ephemeral(&self, poller: Arc<Poller>) {
        debug!(poller = %poller.id(), "Ephemeral poller tracked");
        self.ephemeral.lock().unwrap().push(poller);
    }

    /// Looks up a persistent instance by id.
    pub fn get(&self, id: &PollerId) -> Option<Arc<Poller>> {
        self.pollers.lock().unwrap().get(id).cloned()
    }

    /// Enumerates instances, optionally including live ephemeral one-shots.
    pub fn list(&self, include_ephemeral: bool) -> Vec<Arc<Poller>> {
        let mut result: Vec<_> = self.pollers.lock().unwrap().values().cloned().collect();
        if include_ephemeral {
            let mut ephemeral = self.ephemeral.lock().unwrap();
            ephemeral.retain(|poller| poller.is_active());
            result.extend(ephemeral.iter().cloned());
        }
        result
    }

    /// Number of registered persistent instances.
    pub fn len(&self) -> usize {
        self.pollers.lock().unwrap().len()
    }

    /// Returns true if no persistent instance is registered.
    pub fn is_empty(&self) -> bool {
        self.pollers.lock().unwrap().is_empty()
    }

    /// Stops and unregisters an instance.
    ///
    /// The instance is removed from the registry immediately; the returned
    /// handle resolves once the engine has fully died (with its terminal
    /// error, if any), so the caller can unregister now but still observe
    /// the eventual teardown.
    pub fn disable(&self, id: &PollerId) -> Result<JoinHandle<Option<String>>, RegistryError> {
        let poller = self
            .pollers
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        info!(poller = %id, "Poller disabled, stopping");
        Ok(tokio::spawn(async move { poller.stop().await }))
    }

    /// Stops every instance, ephemeral ones included. Resolves once all have
    /// died.
    pub async fn shutdown(&self) {
        let pollers: Vec<_> = self.pollers.lock().unwrap().drain().map(|(_, p)| p).collect();
        let ephemeral: Vec<_> = self.ephemeral.lock().unwrap().drain(..).collect();

        for poller in pollers.into_iter().chain(ephemeral) {
            poller.stop().await;
        }
        info!("Registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceSettings, PollerConfig, StaticConfigSource};
    use crate::types::{ArtifactMap, StepId};
    use crate::workflow::{StepContext, StepError, Workflow};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::time::Duration;

    struct NoopWorkflow {
        steps: Vec<StepId>,
    }

    impl NoopWorkflow {
        fn new() -> Self {
            NoopWorkflow {
                steps: vec![StepId::new("collect")],
            }
        }
    }

    #[async_trait]
    impl Workflow for NoopWorkflow {
        fn name(&self) -> &str {
            "noop"
        }

        fn steps(&self) -> &[StepId] {
            &self.steps
        }

        async fn run_step(
            &self,
            step: &StepId,
            cx: &mut StepContext<'_>,
        ) -> Result<(), StepError> {
            cx.store_artifact(step, json!("ok"));
            Ok(())
        }

        fn assemble_report(&self, _artifacts: &ArtifactMap) -> Result<Value, StepError> {
            Ok(json!({}))
        }

        async fn cleanup(&self, _artifacts: &mut ArtifactMap) {}
    }

    fn make_poller(id: &str) -> Arc<Poller> {
        let device = DeviceSettings {
            host: "gw.example".to_string(),
            port: 8443,
            username: "monitor".to_string(),
            password: "secret".to_string(),
        };
        let source = Arc::new(StaticConfigSource::new(PollerConfig::new(
            device,
            Duration::from_secs(3600),
        )));
        Arc::new(Poller::new(
            PollerId::new(id),
            Arc::new(NoopWorkflow::new()),
            source,
        ))
    }

    #[tokio::test]
    async fn register_and_get() {
        let registry = PollerRegistry::new();
        registry.register(make_poller("a")).unwrap();

        assert!(registry.get(&PollerId::new("a")).is_some());
        assert!(registry.get(&PollerId::new("b")).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = PollerRegistry::new();
        registry.register(make_poller("a")).unwrap();

        assert!(matches!(
            registry.register(make_poller("a")),
            Err(RegistryError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn list_excludes_ephemeral_by_default() {
        let registry = PollerRegistry::new();
        registry.register(make_poller("a")).unwrap();
        registry.register_ephemeral(make_poller("demo"));

        assert_eq!(registry.list(false).len(), 1);
    }

    #[tokio::test]
    async fn inactive_ephemerals_are_pruned_on_enumeration() {
        let registry = PollerRegistry::new();
        // Never started, therefore not active; pruned on first enumeration.
        registry.register_ephemeral(make_poller("demo"));

        assert_eq!(registry.list(true).len(), 0);
    }

    #[tokio::test]
    async fn disable_unregisters_immediately_and_resolves_later() {
        let registry = PollerRegistry::new();
        registry.register(make_poller("a")).unwrap();

        let teardown = registry.disable(&PollerId::new("a")).unwrap();
        // Unregistered immediately.
        assert!(registry.get(&PollerId::new("a")).is_none());
        // Idle instance tears down with no terminal error.
        assert_eq!(teardown.await.unwrap(), None);
    }

    #[tokio::test]
    async fn disable_unknown_id_fails() {
        let registry = PollerRegistry::new();
        assert!(matches!(
            registry.disable(&PollerId::new("missing")),
            Err(RegistryError::NotFound(_))
        ));
    }
}
