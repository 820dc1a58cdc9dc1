//! Live cluster access.
//!
//! The reconciliation core never talks to a concrete orchestrator API; it
//! goes through [`ClusterClient`], which production wiring implements on top
//! of its API client and tests implement with [`memory::MemoryCluster`].

pub mod bootstrap;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use crossbeam_channel::Receiver;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::snapshot::{
    RepositoryResource, ResourceKey, ResourceKind, COMMIT_REF_ANNOTATION, SOURCE_HASH_ANNOTATION,
};

pub use bootstrap::{DefaultBootstrap, NamespaceBootstrap};
pub use memory::MemoryCluster;

/// Errors returned by a cluster client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Namespace '{0}' is not active")]
    NamespaceNotReady(String),

    #[error("Conflicting update: {0}")]
    Conflict(String),

    #[error("Cluster API error: {0}")]
    Api(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Lifecycle phase of a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum NamespacePhase {
    Active,
    Terminating,
    Other(String),
}

impl NamespacePhase {
    pub fn is_active(&self) -> bool {
        matches!(self, NamespacePhase::Active)
    }
}

impl fmt::Display for NamespacePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespacePhase::Active => f.write_str("Active"),
            NamespacePhase::Terminating => f.write_str("Terminating"),
            NamespacePhase::Other(phase) => f.write_str(phase),
        }
    }
}

/// A live resource in a tenant namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterResource {
    pub namespace: String,
    pub kind: ResourceKind,
    pub name: String,
    /// Opaque version token assigned by the cluster.
    pub resource_version: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub spec: Value,
}

impl ClusterResource {
    /// Builds the live form of a desired resource, annotated with its hash and commit.
    pub fn from_repository(namespace: impl Into<String>, resource: &RepositoryResource) -> Self {
        let mut annotations = resource.metadata.annotations.clone();
        annotations.insert(SOURCE_HASH_ANNOTATION.to_string(), resource.hash().to_string());

        Self {
            namespace: namespace.into(),
            kind: resource.kind,
            name: resource.name().to_string(),
            resource_version: None,
            annotations,
            spec: resource.spec.clone(),
        }
    }

    /// Hash of the desired resource this object was last applied from.
    pub fn source_hash(&self) -> Option<&str> {
        self.annotations
            .get(SOURCE_HASH_ANNOTATION)
            .map(String::as_str)
    }

    pub fn commit_ref(&self) -> Option<&str> {
        self.annotations
            .get(COMMIT_REF_ANNOTATION)
            .map(String::as_str)
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, self.kind, &self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WatchAction {
    Added,
    Modified,
    Deleted,
}

/// A change notification for one live resource.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub resource: ClusterResource,
}

/// Operations the reconciliation core needs from the cluster API.
///
/// Implementations are called concurrently from worker and watch threads.
pub trait ClusterClient: Send + Sync {
    /// Phase of `namespace`, or `None` if it does not exist.
    fn namespace_phase(&self, namespace: &str) -> Result<Option<NamespacePhase>>;

    fn create_namespace(&self, namespace: &str) -> Result<()>;

    /// Deleting an absent namespace is not an error.
    fn delete_namespace(&self, namespace: &str) -> Result<()>;

    fn list_resources(&self, namespace: &str, kind: ResourceKind) -> Result<Vec<ClusterResource>>;

    fn get_resource(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ClusterResource>>;

    fn create_resource(&self, resource: &ClusterResource) -> Result<()>;

    fn replace_resource(&self, resource: &ClusterResource) -> Result<()>;

    fn delete_resource(&self, namespace: &str, kind: ResourceKind, name: &str) -> Result<()>;

    /// Change notifications for every resource of `kind` across namespaces.
    fn watch(&self, kind: ResourceKind) -> Receiver<WatchEvent>;

    /// Replaces the resource if it exists, creates it otherwise.
    fn create_or_replace_resource(&self, resource: &ClusterResource) -> Result<()> {
        match self.get_resource(&resource.namespace, resource.kind, &resource.name)? {
            Some(_) => self.replace_resource(resource),
            None => self.create_resource(resource),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_repository_annotations() {
        let mut desired = RepositoryResource::new(ResourceKind::Box, "box-a", json!({"x": 1}));
        desired.set_commit_ref("c0ffee");

        let live = ClusterResource::from_repository("ns-alpha", &desired);
        assert_eq!(live.source_hash(), Some(desired.hash()));
        assert_eq!(live.commit_ref(), Some("c0ffee"));
        assert_eq!(live.key().to_string(), "ns-alpha:Box/box-a");
        assert_eq!(live.spec, json!({"x": 1}));
    }

    #[test]
    fn test_namespace_phase() {
        assert!(NamespacePhase::Active.is_active());
        assert!(!NamespacePhase::Terminating.is_active());
        assert_eq!(NamespacePhase::Other("Pending".into()).to_string(), "Pending");
    }
}
