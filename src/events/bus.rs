//! Ordered event delivery with per-listener isolation.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{trace, warn};

use super::event::LifecycleEvent;

/// A consumer of lifecycle events.
///
/// Listeners run on the engine's control task: a slow listener delays the
/// engine (by design — report consumers must observe the event before the
/// next cycle begins), but a panicking or erroring listener is caught and
/// logged, never propagated.
#[async_trait]
pub trait LifecycleListener: Send + Sync {
    /// Handles one event. Errors are logged and swallowed.
    async fn on_event(&self, event: &LifecycleEvent) -> Result<(), String>;

    /// Listener name for log attribution.
    fn name(&self) -> &str {
        "listener"
    }
}

/// Ordered, at-most-once-per-listener notification of engine lifecycle
/// transitions.
///
/// Listeners are registered before the engine starts and invoked in
/// registration order for every event. There is no unsubscribe: the bus lives
/// exactly as long as the engine that owns it.
#[derive(Clone, Default)]
pub struct LifecycleBus {
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

impl LifecycleBus {
    /// Creates a bus with no listeners.
    pub fn new() -> Self {
        LifecycleBus::default()
    }

    /// Appends a listener; it will observe every subsequent event after all
    /// previously registered listeners.
    pub fn subscribe(&mut self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.push(listener);
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Delivers an event to every listener, in registration order.
    ///
    /// Each listener gets the event exactly once. A listener that returns an
    /// error or panics is logged; delivery continues with the next listener.
    pub async fn emit(&self, event: &LifecycleEvent) {
        trace!(kind = event.kind(), poller = %event.poller(), "Emitting lifecycle event");

        for listener in &self.listeners {
            let delivery = std::panic::AssertUnwindSafe(listener.on_event(event)).catch_unwind();
            match delivery.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        listener = listener.name(),
                        kind = event.kind(),
                        error = %e,
                        "Listener rejected event"
                    );
                }
                Err(_) => {
                    warn!(
                        listener = listener.name(),
                        kind = event.kind(),
                        "Listener panicked"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PollerId;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl LifecycleListener for Recorder {
        async fn on_event(&self, event: &LifecycleEvent) -> Result<(), String> {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, event.kind()));
            Ok(())
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    struct Panicker;

    #[async_trait]
    impl LifecycleListener for Panicker {
        async fn on_event(&self, _event: &LifecycleEvent) -> Result<(), String> {
            panic!("bad listener");
        }
    }

    struct Failer;

    #[async_trait]
    impl LifecycleListener for Failer {
        async fn on_event(&self, _event: &LifecycleEvent) -> Result<(), String> {
            Err("nope".to_string())
        }
    }

    fn started() -> LifecycleEvent {
        LifecycleEvent::Started {
            poller: PollerId::new("p1"),
        }
    }

    #[tokio::test]
    async fn delivers_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = LifecycleBus::new();
        bus.subscribe(Arc::new(Recorder {
            name: "first",
            seen: Arc::clone(&seen),
        }));
        bus.subscribe(Arc::new(Recorder {
            name: "second",
            seen: Arc::clone(&seen),
        }));

        bus.emit(&started()).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:started".to_string(), "second:started".to_string()]
        );
    }

    #[tokio::test]
    async fn panicking_listener_does_not_block_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = LifecycleBus::new();
        bus.subscribe(Arc::new(Panicker));
        bus.subscribe(Arc::new(Recorder {
            name: "after",
            seen: Arc::clone(&seen),
        }));

        bus.emit(&started()).await;

        assert_eq!(*seen.lock().unwrap(), vec!["after:started".to_string()]);
    }

    #[tokio::test]
    async fn erroring_listener_is_swallowed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = LifecycleBus::new();
        bus.subscribe(Arc::new(Failer));
        bus.subscribe(Arc::new(Recorder {
            name: "after",
            seen: Arc::clone(&seen),
        }));

        bus.emit(&started()).await;
        bus.emit(&started()).await;

        // Both events reached the healthy listener exactly once each.
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["after:started".to_string(), "after:started".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_bus_emits_without_error() {
        let bus = LifecycleBus::new();
        bus.emit(&started()).await;
    }
}
