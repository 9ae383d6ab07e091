//! Ordered in-process dispatch of lifecycle events.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::events::LifecycleEvent;
use crate::Result;

/// Receives lifecycle events.
#[async_trait]
pub trait LifecycleEventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handle `event`. Events a handler does not care about must return `Ok`.
    async fn on_event(&self, event: &LifecycleEvent) -> Result<()>;
}

/// Ordered list of handlers.
///
/// Registration order is priority order: handlers run one after another in
/// the order they were registered, and dispatch stops at the first handler
/// that fails. Handlers registered after a failing one never see the event.
#[derive(Default)]
pub struct EventHandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn LifecycleEventHandler>>>,
}

impl EventHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler`; it runs after every handler registered before it.
    pub fn register(&self, handler: Arc<dyn LifecycleEventHandler>) {
        debug!(handler = handler.name(), "Registering lifecycle handler");
        self.handlers.write().push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Deliver `event` to every handler in order, stopping at the first error.
    pub async fn dispatch(&self, event: &LifecycleEvent) -> Result<()> {
        // Snapshot so the lock is not held across awaits.
        let handlers: Vec<_> = self.handlers.read().clone();
        for handler in handlers {
            if let Err(e) = handler.on_event(event).await {
                warn!(
                    handler = handler.name(),
                    event = event.name(),
                    subject = event.subject_id(),
                    error = %e,
                    "Lifecycle handler failed, stopping dispatch"
                );
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl LifecycleEventHandler for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_event(&self, _event: &LifecycleEvent) -> Result<()> {
            self.log.lock().push(self.name);
            if self.fail {
                Err(Error::validation(format!("{} failed", self.name)))
            } else {
                Ok(())
            }
        }
    }

    fn event() -> LifecycleEvent {
        LifecycleEvent::TransferTerminated {
            transfer_process_id: "tp".into(),
            reason: None,
            transfer: None,
        }
    }

    fn registry(handlers: &[(&'static str, bool)]) -> (EventHandlerRegistry, Arc<Mutex<Vec<&'static str>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = EventHandlerRegistry::new();
        for (name, fail) in handlers {
            registry.register(Arc::new(Recorder {
                name: *name,
                fail: *fail,
                log: log.clone(),
            }));
        }
        (registry, log)
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let (registry, log) = registry(&[("first", false), ("second", false), ("third", false)]);
        registry.dispatch(&event()).await.unwrap();
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_dispatch_stops_at_first_failure() {
        let (registry, log) = registry(&[("first", false), ("broken", true), ("never", false)]);
        let err = registry.dispatch(&event()).await.unwrap_err();
        assert!(err.to_string().contains("broken failed"));
        assert_eq!(*log.lock(), vec!["first", "broken"]);
    }

    #[tokio::test]
    async fn test_empty_registry_succeeds() {
        let registry = EventHandlerRegistry::new();
        assert!(registry.is_empty());
        registry.dispatch(&event()).await.unwrap();
    }
}
