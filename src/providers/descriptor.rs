//! Provider descriptors and capability grants.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::scope::ScopeType;

/// How a provider authenticates connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Oauth2,
    ApiKey,
    AppInstall,
}

/// What happens when a capability is invoked without its required grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeniedBehavior {
    Block,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub required_grants: Vec<String>,
    #[serde(default)]
    pub optional_grants: Vec<String>,
    pub denied_behavior: DeniedBehavior,
}

impl CapabilityDescriptor {
    pub fn new(name: &str, required_grants: &[&str], denied_behavior: DeniedBehavior) -> Self {
        Self {
            name: name.to_string(),
            required_grants: required_grants.iter().map(|g| g.to_string()).collect(),
            optional_grants: Vec::new(),
            denied_behavior,
        }
    }

    pub fn with_optional(mut self, grants: &[&str]) -> Self {
        self.optional_grants = grants.iter().map(|g| g.to_string()).collect();
        self
    }

    /// Required grants absent from `granted`, in declaration order.
    pub fn missing_grants(&self, granted: &[String]) -> Vec<String> {
        self.required_grants
            .iter()
            .filter(|grant| !granted.contains(grant))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProviderDescriptor {
    pub id: String,
    pub name: String,
    pub auth_kind: AuthKind,
    pub supported_scope_types: Vec<ScopeType>,
    /// Grants requested when a connect call does not name any.
    pub default_grants: Vec<String>,
    pub capabilities: Vec<CapabilityDescriptor>,
}

impl ProviderDescriptor {
    pub fn capability(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.capabilities.iter().find(|c| c.name == name)
    }

    pub fn supports_scope(&self, scope_type: ScopeType) -> bool {
        self.supported_scope_types.contains(&scope_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_grants_lists_absent_requirements() {
        let capability =
            CapabilityDescriptor::new("repo.write", &["repo", "write:org"], DeniedBehavior::Block);
        assert_eq!(
            capability.missing_grants(&["repo".to_string()]),
            vec!["write:org".to_string()]
        );
        assert!(
            capability
                .missing_grants(&["write:org".to_string(), "repo".to_string()])
                .is_empty()
        );
    }
}
