//! Per-tenant propagation settings.

use serde::Serialize;
use serde_json::Value;

use super::resource::RepositoryResource;

/// Spec key of the settings document that controls propagation.
pub const PROPAGATION_KEY: &str = "k8s-propagation";

/// How a tenant's repository state reaches the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    /// Nothing is propagated.
    #[default]
    Off,
    /// The tenant namespace must not exist.
    Deny,
    /// Repository changes are synchronized to the cluster.
    Sync,
    /// Synchronized, and live drift is reverted by the watcher.
    Rule,
}

impl Propagation {
    /// Unrecognized values behave as [`Propagation::Off`].
    pub fn parse(value: &Value) -> Self {
        match value {
            Value::Bool(true) => Propagation::Sync,
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "deny" => Propagation::Deny,
                "sync" | "true" => Propagation::Sync,
                "rule" => Propagation::Rule,
                _ => Propagation::Off,
            },
            _ => Propagation::Off,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantSettings {
    pub propagation: Propagation,
}

impl TenantSettings {
    pub fn from_resource(resource: &RepositoryResource) -> Self {
        let propagation = resource
            .spec
            .get(PROPAGATION_KEY)
            .map(Propagation::parse)
            .unwrap_or_default();
        Self { propagation }
    }

    pub fn is_propagation_denied(&self) -> bool {
        self.propagation == Propagation::Deny
    }

    pub fn is_sync_required(&self) -> bool {
        matches!(self.propagation, Propagation::Sync | Propagation::Rule)
    }

    pub fn is_governance_required(&self) -> bool {
        self.propagation == Propagation::Rule
    }
}
