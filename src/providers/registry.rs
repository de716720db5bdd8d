//! Provider registry
//!
//! Read-mostly map of provider lifecycles keyed by trimmed id. Iteration is
//! lexicographic on id regardless of registration order.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::{CapabilityDescriptor, ProviderDescriptor, ProviderLifecycle};

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Provider id must not be empty")]
    EmptyId,
    #[error("Provider '{id}' is already registered")]
    Duplicate { id: String },
    #[error("Provider '{id}' is invalid: {reason}")]
    Invalid { id: String, reason: String },
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<BTreeMap<String, Arc<dyn ProviderLifecycle>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn ProviderLifecycle>) -> Result<(), RegistryError> {
        let id = provider.descriptor().id.trim().to_string();
        if id.is_empty() {
            return Err(RegistryError::EmptyId);
        }

        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if providers.contains_key(&id) {
            return Err(RegistryError::Duplicate { id });
        }
        tracing::debug!(provider = %id, "Registered provider");
        providers.insert(id, provider);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<dyn ProviderLifecycle>> {
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id.trim())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderLifecycle>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.trim())
            .cloned()
    }

    /// Providers sorted by id.
    pub fn list(&self) -> Vec<Arc<dyn ProviderLifecycle>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.list()
            .iter()
            .map(|provider| provider.descriptor().clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn capability(&self, provider_id: &str, capability: &str) -> Option<CapabilityDescriptor> {
        self.get(provider_id)
            .and_then(|provider| provider.descriptor().capability(capability).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ExampleProvider;

    #[test]
    fn list_is_sorted_regardless_of_registration_order() {
        let registry = ProviderRegistry::new();
        registry
            .register(Arc::new(ExampleProvider::with_id(" zeta ")))
            .unwrap();
        registry.register(Arc::new(ExampleProvider::with_id("alpha"))).unwrap();
        registry.register(Arc::new(ExampleProvider::new())).unwrap();

        assert_eq!(registry.ids(), vec!["alpha", "example", "zeta"]);
        assert!(registry.get("zeta").is_some());
        assert!(registry.get(" zeta").is_some());
    }

    #[test]
    fn duplicate_and_empty_ids_are_rejected() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(ExampleProvider::new())).unwrap();

        assert_eq!(
            registry.register(Arc::new(ExampleProvider::new())),
            Err(RegistryError::Duplicate {
                id: "example".into()
            })
        );
        assert_eq!(
            registry.register(Arc::new(ExampleProvider::with_id("  "))),
            Err(RegistryError::EmptyId)
        );
    }

    #[test]
    fn unregister_and_capability_lookup() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(ExampleProvider::new())).unwrap();

        let capability = registry.capability("example", "records.read").unwrap();
        assert_eq!(capability.required_grants, vec!["records:read"]);
        assert!(registry.capability("example", "missing").is_none());

        assert!(registry.unregister("example").is_some());
        assert!(registry.get("example").is_none());
    }
}
