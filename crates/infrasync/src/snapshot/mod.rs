//! Typed, hashed view of a tenant branch at one commit.

pub mod loader;
pub mod resource;
pub mod settings;

use serde::Serialize;

use crate::repository::{RepositoryGuard, Result};

pub use loader::SnapshotLoader;
pub use resource::{
    content_hash, ObjectMeta, RepositoryResource, ResourceKey, ResourceKind, API_VERSION,
    COMMIT_REF_ANNOTATION, SOURCE_HASH_ANNOTATION,
};
pub use settings::{Propagation, TenantSettings};

/// The desired state of a tenant: every resource read from one checkout.
#[derive(Debug, Clone)]
pub struct RepositorySnapshot {
    pub commit_ref: String,
    pub resources: Vec<RepositoryResource>,
    /// `None` when the branch carries no settings document.
    pub settings: Option<TenantSettings>,
}

impl RepositorySnapshot {
    pub fn new(commit_ref: impl Into<String>, resources: Vec<RepositoryResource>) -> Self {
        let settings = resources
            .iter()
            .find(|r| r.kind == ResourceKind::Settings)
            .map(TenantSettings::from_resource);
        Self {
            commit_ref: commit_ref.into(),
            resources,
            settings,
        }
    }

    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<&RepositoryResource> {
        self.resources
            .iter()
            .find(|r| r.kind == kind && r.name() == name)
    }

    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &RepositoryResource> {
        self.resources.iter().filter(move |r| r.kind == kind)
    }

    /// Resources with a live cluster counterpart.
    pub fn managed(&self) -> impl Iterator<Item = &RepositoryResource> {
        self.resources.iter().filter(|r| r.kind.is_managed())
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            commit_ref: self.commit_ref.clone(),
            resource_count: self.resources.len(),
            settings: self.settings.clone(),
        }
    }
}

/// Serializable overview of a snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub commit_ref: String,
    pub resource_count: usize,
    pub settings: Option<TenantSettings>,
}

/// Produces the current snapshot of a tenant.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self, tenant: &str) -> Result<RepositorySnapshot>;
}

/// Checks the branch out and reads it.
///
/// The guard keeps the tree from changing between checkout and scan, so
/// the commit ref always belongs to the resources returned with it.
pub fn get_snapshot(guard: &mut RepositoryGuard<'_>) -> Result<RepositorySnapshot> {
    let commit_ref = guard.checkout()?;
    let mut resources = guard.loader().load()?;
    for resource in &mut resources {
        resource.set_commit_ref(commit_ref.clone());
    }
    log::debug!(
        "Loaded snapshot of '{}' at {} ({} resources)",
        guard.tenant(),
        commit_ref,
        resources.len()
    );
    Ok(RepositorySnapshot::new(commit_ref, resources))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_settings_and_lookup() {
        let snapshot = RepositorySnapshot::new(
            "abc",
            vec![
                RepositoryResource::new(
                    ResourceKind::Settings,
                    "settings",
                    json!({"k8s-propagation": "rule"}),
                ),
                RepositoryResource::new(ResourceKind::Box, "box-a", json!({})),
                RepositoryResource::new(ResourceKind::UiFile, "layout", json!({})),
            ],
        );

        assert!(snapshot.settings.as_ref().unwrap().is_governance_required());
        assert!(snapshot.get(ResourceKind::Box, "box-a").is_some());
        assert!(snapshot.get(ResourceKind::Link, "box-a").is_none());
        assert_eq!(snapshot.managed().count(), 1);
        assert_eq!(snapshot.summary().resource_count, 3);
    }

    #[test]
    fn test_snapshot_without_settings() {
        let snapshot = RepositorySnapshot::new("abc", Vec::new());
        assert!(snapshot.settings.is_none());
    }
}
