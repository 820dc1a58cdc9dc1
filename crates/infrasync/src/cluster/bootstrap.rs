//! Namespace preparation before resources are applied.

use super::{ClusterClient, ClusterError, NamespacePhase, Result};
use crate::snapshot::RepositorySnapshot;

/// Makes sure a tenant namespace and its baseline objects exist.
pub trait NamespaceBootstrap: Send + Sync {
    /// Fails with [`ClusterError::NamespaceNotReady`] when the namespace
    /// exists but cannot take resources yet.
    fn ensure_namespace(
        &self,
        cluster: &dyn ClusterClient,
        namespace: &str,
        snapshot: &RepositorySnapshot,
    ) -> Result<()>;
}

/// Creates the namespace when missing; baseline objects are left to the cluster.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBootstrap;

impl NamespaceBootstrap for DefaultBootstrap {
    fn ensure_namespace(
        &self,
        cluster: &dyn ClusterClient,
        namespace: &str,
        _snapshot: &RepositorySnapshot,
    ) -> Result<()> {
        match cluster.namespace_phase(namespace)? {
            None => {
                log::info!("Creating namespace '{}'", namespace);
                match cluster.create_namespace(namespace) {
                    Ok(()) | Err(ClusterError::AlreadyExists(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            Some(NamespacePhase::Active) => Ok(()),
            Some(phase) => {
                log::info!("Namespace '{}' is {}, not ready", namespace, phase);
                Err(ClusterError::NamespaceNotReady(namespace.to_string()))
            }
        }
    }
}
