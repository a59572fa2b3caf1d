//! Per-instance poller configuration.
//!
//! Configuration is owned by an external source (a controller database, a
//! settings service); the engine consumes it through [`ConfigSource`],
//! fetching lazily on first need and caching for the engine's lifetime. The
//! cache is invalidated at cleanup so a new cycle observes fresh settings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::budget::{BudgetEntry, RetryBudget};
use crate::types::PollerId;

/// Default worker count for a poller's task scheduler.
const DEFAULT_WORKERS: usize = 4;

/// Errors raised while loading configuration.
///
/// Raised at the phase that first needs the configuration (typically the
/// first collect step) and treated there as a recoverable phase error
/// subject to that phase's retry budget.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// No configuration exists for this instance.
    #[error("no configuration for poller {0}")]
    NotFound(PollerId),

    /// The configuration exists but fails validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The configuration source could not be reached.
    #[error("configuration source unavailable: {0}")]
    Unavailable(String),
}

/// Connection settings for the remote managed device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    /// Device host (name or address).
    pub host: String,

    /// Management port.
    pub port: u16,

    /// Login user.
    pub username: String,

    /// Login secret. Decryption happens upstream; this is the plaintext the
    /// client uses.
    pub password: String,
}

/// Settings for the remote analysis service used by diagnostics-style
/// pollers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteServiceSettings {
    /// Service endpoint URL.
    pub endpoint: String,

    /// Service credential.
    pub api_key: String,

    /// Optional proxy URL.
    pub proxy: Option<String>,
}

/// Scheduling settings for one poller instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSettings {
    /// Interval between cycle starts.
    pub interval: Duration,

    /// How far past its recorded due time a restored schedule still counts
    /// as actionable. A checkpoint older than this recomputes a fresh
    /// schedule. `None` means 2x the interval.
    pub past_due_window: Option<Duration>,
}

impl ScheduleSettings {
    /// Creates settings with the default past-due window.
    pub fn new(interval: Duration) -> Self {
        ScheduleSettings {
            interval,
            past_due_window: None,
        }
    }

    /// Returns the effective past-due window.
    pub fn effective_past_due_window(&self) -> Duration {
        self.past_due_window.unwrap_or(self.interval * 2)
    }
}

/// Complete configuration for one poller instance.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Remote device connection.
    pub device: DeviceSettings,

    /// Remote analysis service, when the workflow needs one.
    pub remote_service: Option<RemoteServiceSettings>,

    /// Scheduling.
    pub schedule: ScheduleSettings,

    /// Per-phase retry budgets.
    pub budgets: HashMap<String, BudgetEntry>,

    /// Budget applied to phases without an explicit entry.
    pub fallback_budget: BudgetEntry,

    /// Worker count for the instance's task scheduler.
    pub workers: usize,
}

impl PollerConfig {
    /// Creates a configuration with default budgets and worker count.
    pub fn new(device: DeviceSettings, interval: Duration) -> Self {
        PollerConfig {
            device,
            remote_service: None,
            schedule: ScheduleSettings::new(interval),
            budgets: HashMap::new(),
            fallback_budget: BudgetEntry::default(),
            workers: DEFAULT_WORKERS,
        }
    }

    /// Sets the budget for one phase.
    pub fn with_budget(mut self, phase: impl Into<String>, entry: BudgetEntry) -> Self {
        self.budgets.insert(phase.into(), entry);
        self
    }

    /// Sets the remote analysis service settings.
    pub fn with_remote_service(mut self, service: RemoteServiceSettings) -> Self {
        self.remote_service = Some(service);
        self
    }

    /// Sets the task scheduler worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Builds the retry budget table from this configuration.
    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget::new(self.budgets.clone(), self.fallback_budget)
    }

    /// Validates invariants a usable configuration must hold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.host.is_empty() {
            return Err(ConfigError::Invalid("device host is empty".to_string()));
        }
        if self.schedule.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "polling interval must be positive".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid(
                "scheduler needs at least one worker".to_string(),
            ));
        }
        Ok(())
    }
}

/// The external configuration provider.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetches the configuration for one poller instance.
    async fn fetch(&self, id: &PollerId) -> Result<PollerConfig, ConfigError>;
}

/// A source that always returns the same configuration.
///
/// Useful for tests and for embedders that resolve configuration up front.
#[derive(Debug, Clone)]
pub struct StaticConfigSource {
    config: PollerConfig,
}

impl StaticConfigSource {
    /// Wraps a fixed configuration.
    pub fn new(config: PollerConfig) -> Self {
        StaticConfigSource { config }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn fetch(&self, _id: &PollerId) -> Result<PollerConfig, ConfigError> {
        Ok(self.config.clone())
    }
}

/// Lazy, lifetime-cached view of one instance's configuration.
///
/// The first `get` fetches and validates; later calls return the cached
/// value until `invalidate` (called by the engine at cleanup).
pub struct ConfigCache {
    id: PollerId,
    source: Arc<dyn ConfigSource>,
    cached: Mutex<Option<Arc<PollerConfig>>>,
}

impl ConfigCache {
    /// Creates an empty cache over a source.
    pub fn new(id: PollerId, source: Arc<dyn ConfigSource>) -> Self {
        ConfigCache {
            id,
            source,
            cached: Mutex::new(None),
        }
    }

    /// Returns the configuration, fetching it if not cached.
    pub async fn get(&self) -> Result<Arc<PollerConfig>, ConfigError> {
        let mut cached = self.cached.lock().await;
        if let Some(config) = cached.as_ref() {
            return Ok(Arc::clone(config));
        }

        let config = self.source.fetch(&self.id).await?;
        config.validate()?;
        debug!(poller = %self.id, "Configuration fetched and cached");

        let config = Arc::new(config);
        *cached = Some(Arc::clone(&config));
        Ok(config)
    }

    /// Drops the cached value so the next `get` fetches fresh.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}
