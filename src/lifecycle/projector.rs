//! Projector registry.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use super::LifecycleEvent;
use crate::error::{ServiceError, ServiceResult};

/// Named handler reacting to lifecycle events.
#[async_trait]
pub trait Projector: Send + Sync {
    fn name(&self) -> &str;

    async fn project(&self, event: &LifecycleEvent) -> ServiceResult<()>;
}

#[derive(Debug)]
pub struct ProjectorFailure {
    pub projector: String,
    pub error: ServiceError,
}

/// Ordered set of projectors. Events are projected sequentially in
/// registration order.
#[derive(Default)]
pub struct ProjectorRegistry {
    projectors: RwLock<Vec<Arc<dyn Projector>>>,
}

impl ProjectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, projector: Arc<dyn Projector>) -> ServiceResult<()> {
        let mut projectors = self
            .projectors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if projectors.iter().any(|p| p.name() == projector.name()) {
            return Err(ServiceError::conflict(format!(
                "projector '{}' is already registered",
                projector.name()
            )));
        }
        projectors.push(projector);
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|p| p.name().to_string()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Projector>> {
        self.projectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run every projector, collecting failures instead of stopping at the first.
    pub async fn project(&self, event: &LifecycleEvent) -> Vec<ProjectorFailure> {
        let mut failures = Vec::new();
        for projector in self.snapshot() {
            if let Err(error) = projector.project(event).await {
                tracing::warn!(
                    projector = projector.name(),
                    event_id = %event.event_id,
                    event_name = %event.event_name,
                    error = %error,
                    "Projector failed"
                );
                failures.push(ProjectorFailure {
                    projector: projector.name().to_string(),
                    error,
                });
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeRef;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Projector for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn project(&self, _event: &LifecycleEvent) -> ServiceResult<()> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                Err(ServiceError::operation("projector failed"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn runs_in_registration_order_and_collects_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ProjectorRegistry::new();
        for (name, fail) in [("first", false), ("second", true), ("third", false)] {
            registry
                .register(Arc::new(Recording {
                    name,
                    fail,
                    log: log.clone(),
                }))
                .unwrap();
        }

        let event = LifecycleEvent::new("services.test", "example", ScopeRef::user("u"));
        let failures = registry.project(&event).await;

        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].projector, "second");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = ProjectorRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = || {
            Arc::new(Recording {
                name: "activity",
                fail: false,
                log: log.clone(),
            })
        };
        registry.register(make()).unwrap();
        assert!(registry.register(make()).is_err());
        assert_eq!(registry.names(), vec!["activity"]);
    }
}
