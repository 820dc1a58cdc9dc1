//! Full convergence of one tenant's namespace to its repository snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::cluster::{ClusterClient, ClusterError, ClusterResource, NamespaceBootstrap};
use crate::config::ClusterConfig;
use crate::drift::{hold, DriftCache};
use crate::error::Result;
use crate::scheduler::{RecoveryScheduler, SyncHandler};
use crate::snapshot::{RepositoryResource, RepositorySnapshot, ResourceKey, ResourceKind, SnapshotSource};

/// Counts of what one convergence pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvergeReport {
    pub commit_ref: String,
    pub created: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl ConvergeReport {
    /// Number of mutating cluster calls that succeeded.
    pub fn mutations(&self) -> usize {
        self.created + self.replaced + self.deleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ConvergeOutcome {
    /// The tenant is not configured for synchronization.
    Skipped,
    /// Propagation is denied; the namespace was removed if it existed.
    NamespaceRemoved,
    /// The namespace is not ready; a recovery was scheduled.
    Deferred,
    Converged(ConvergeReport),
}

/// Everything the engine and the drift watcher share.
#[derive(Clone)]
pub struct ReconcileContext {
    pub snapshots: Arc<dyn SnapshotSource>,
    pub cluster: Arc<dyn ClusterClient>,
    pub cache: Arc<DriftCache>,
    pub recovery: Arc<RecoveryScheduler>,
    pub namespaces: ClusterConfig,
}

pub struct ReconciliationEngine {
    ctx: ReconcileContext,
    bootstrap: Arc<dyn NamespaceBootstrap>,
}

impl ReconciliationEngine {
    pub fn new(ctx: ReconcileContext, bootstrap: Arc<dyn NamespaceBootstrap>) -> Self {
        Self { ctx, bootstrap }
    }

    /// Makes the tenant's namespace match its repository branch.
    ///
    /// Snapshot errors abort the pass. Failures on single resources are
    /// logged and counted in the report; the remaining resources are still
    /// processed.
    pub fn converge_tenant(&self, tenant: &str) -> Result<ConvergeOutcome> {
        let span = tracing::info_span!("converge", tenant = %tenant);
        let _enter = span.enter();

        let snapshot = self.ctx.snapshots.snapshot(tenant)?;
        let namespace = self.ctx.namespaces.namespace_for(tenant);
        let settings = snapshot.settings.clone().unwrap_or_default();

        if settings.is_propagation_denied() {
            return self.remove_namespace(&namespace);
        }
        if !settings.is_sync_required() {
            log::debug!("Synchronization of '{}' is not enabled, skipping", tenant);
            return Ok(ConvergeOutcome::Skipped);
        }

        match self
            .bootstrap
            .ensure_namespace(self.ctx.cluster.as_ref(), &namespace, &snapshot)
        {
            Ok(()) => {}
            Err(ClusterError::NamespaceNotReady(_)) => {
                self.ctx.recovery.schedule(tenant);
                return Ok(ConvergeOutcome::Deferred);
            }
            Err(e) => return Err(e.into()),
        }

        let mut report = ConvergeReport {
            commit_ref: snapshot.commit_ref.clone(),
            ..Default::default()
        };
        for kind in ResourceKind::managed() {
            self.converge_kind(&namespace, *kind, &snapshot, &mut report);
        }

        log::info!(
            "Converged '{}' at {}: {} created, {} replaced, {} deleted, {} unchanged, {} failed",
            tenant,
            report.commit_ref,
            report.created,
            report.replaced,
            report.deleted,
            report.unchanged,
            report.failed
        );
        Ok(ConvergeOutcome::Converged(report))
    }

    fn remove_namespace(&self, namespace: &str) -> Result<ConvergeOutcome> {
        if self.ctx.cluster.namespace_phase(namespace)?.is_some() {
            log::info!("Propagation denied, deleting namespace '{}'", namespace);
            self.ctx.cluster.delete_namespace(namespace)?;
        }
        self.ctx.cache.remove_namespace(namespace);
        Ok(ConvergeOutcome::NamespaceRemoved)
    }

    fn converge_kind(
        &self,
        namespace: &str,
        kind: ResourceKind,
        snapshot: &RepositorySnapshot,
        report: &mut ConvergeReport,
    ) {
        let live = match self.ctx.cluster.list_resources(namespace, kind) {
            Ok(live) => live,
            Err(e) => {
                log::error!("Failed to list {} in '{}': {}", kind, namespace, e);
                report.failed += 1;
                return;
            }
        };
        let mut live: HashMap<String, ClusterResource> =
            live.into_iter().map(|r| (r.name.clone(), r)).collect();

        for desired in snapshot.of_kind(kind) {
            let current = live.remove(desired.name());
            match self.apply(namespace, desired, current.as_ref()) {
                Ok(Applied::Created) => report.created += 1,
                Ok(Applied::Replaced) => report.replaced += 1,
                Ok(Applied::Unchanged) => report.unchanged += 1,
                Err(e) => {
                    log::error!(
                        "Failed to apply {}: {}",
                        ResourceKey::new(namespace, kind, desired.name()),
                        e
                    );
                    report.failed += 1;
                }
            }
        }

        for extra in live.into_values() {
            let key = extra.key();
            match self.delete(&key) {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    log::error!("Failed to delete {}: {}", key, e);
                    report.failed += 1;
                }
            }
        }
    }

    fn apply(
        &self,
        namespace: &str,
        desired: &RepositoryResource,
        current: Option<&ClusterResource>,
    ) -> std::result::Result<Applied, ClusterError> {
        let key = ResourceKey::new(namespace, desired.kind, desired.name());
        let lock = self.ctx.cache.lock_for(&key);
        let _held = hold(&lock);

        let applied = match current {
            None => {
                let resource = ClusterResource::from_repository(namespace, desired);
                match self.ctx.cluster.create_resource(&resource) {
                    Ok(()) => {
                        log::info!("Created {}", key);
                        Applied::Created
                    }
                    Err(ClusterError::AlreadyExists(_)) => {
                        self.ctx.cluster.replace_resource(&resource)?;
                        log::info!("Replaced {} (appeared concurrently)", key);
                        Applied::Replaced
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(live) if live.source_hash() != Some(desired.hash()) => {
                let resource = ClusterResource::from_repository(namespace, desired);
                self.ctx.cluster.replace_resource(&resource)?;
                log::info!("Replaced {}", key);
                Applied::Replaced
            }
            Some(_) => Applied::Unchanged,
        };

        self.ctx.cache.add(key, desired.hash());
        Ok(applied)
    }

    fn delete(&self, key: &ResourceKey) -> std::result::Result<(), ClusterError> {
        let lock = self.ctx.cache.lock_for(key);
        let _held = hold(&lock);

        match self
            .ctx
            .cluster
            .delete_resource(&key.namespace, key.kind, &key.name)
        {
            Ok(()) | Err(ClusterError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.ctx.cache.remove(key);
        log::info!("Deleted {}", key);
        Ok(())
    }
}

enum Applied {
    Created,
    Replaced,
    Unchanged,
}

impl SyncHandler for ReconciliationEngine {
    fn sync_tenant(&self, tenant: &str) {
        match self.converge_tenant(tenant) {
            Ok(ConvergeOutcome::Converged(_)) => {}
            Ok(ConvergeOutcome::Skipped) => {}
            Ok(ConvergeOutcome::NamespaceRemoved) => {
                log::info!("Namespace of '{}' removed", tenant)
            }
            Ok(ConvergeOutcome::Deferred) => {
                log::info!("Synchronization of '{}' deferred until its namespace is ready", tenant)
            }
            Err(e) if e.is_retryable() => {
                log::warn!("Synchronization of '{}' failed, will retry on next pass: {}", tenant, e)
            }
            Err(e) => log::error!("Synchronization of '{}' failed: {}", tenant, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{DefaultBootstrap, MemoryCluster, NamespacePhase};
    use crate::events::EventRouter;
    use crate::repository::{RepositoryError, Result as RepoResult};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Snapshot source backed by a mutable in-memory snapshot.
    struct FixedSnapshots {
        snapshot: Mutex<RepositorySnapshot>,
        calls: AtomicUsize,
        fail: Mutex<bool>,
    }

    impl FixedSnapshots {
        fn new(resources: Vec<RepositoryResource>) -> Arc<Self> {
            Arc::new(Self {
                snapshot: Mutex::new(RepositorySnapshot::new("c1", resources)),
                calls: AtomicUsize::new(0),
                fail: Mutex::new(false),
            })
        }

        fn set(&self, commit: &str, resources: Vec<RepositoryResource>) {
            *self.snapshot.lock().unwrap() = RepositorySnapshot::new(commit, resources);
        }
    }

    impl SnapshotSource for FixedSnapshots {
        fn snapshot(&self, _tenant: &str) -> RepoResult<RepositorySnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail.lock().unwrap() {
                return Err(RepositoryError::GitNetworkError("unreachable".into()));
            }
            Ok(self.snapshot.lock().unwrap().clone())
        }
    }

    fn settings(mode: &str) -> RepositoryResource {
        RepositoryResource::new(
            ResourceKind::Settings,
            "settings",
            json!({ "k8s-propagation": mode }),
        )
    }

    fn boxed(name: &str, spec: Value) -> RepositoryResource {
        RepositoryResource::new(ResourceKind::Box, name, spec)
    }

    struct Fixture {
        engine: ReconciliationEngine,
        cluster: Arc<MemoryCluster>,
        cache: Arc<DriftCache>,
        snapshots: Arc<FixedSnapshots>,
        recovery: Arc<RecoveryScheduler>,
    }

    fn fixture(resources: Vec<RepositoryResource>) -> Fixture {
        let cluster = Arc::new(MemoryCluster::new());
        let cache = Arc::new(DriftCache::new());
        let snapshots = FixedSnapshots::new(resources);
        let recovery = Arc::new(RecoveryScheduler::new(
            cluster.clone(),
            Arc::new(EventRouter::new(512, 64)),
            ClusterConfig::default(),
            Duration::from_secs(60),
        ));
        let ctx = ReconcileContext {
            snapshots: snapshots.clone(),
            cluster: cluster.clone(),
            cache: Arc::clone(&cache),
            recovery: Arc::clone(&recovery),
            namespaces: ClusterConfig::default(),
        };
        Fixture {
            engine: ReconciliationEngine::new(ctx, Arc::new(DefaultBootstrap)),
            cluster,
            cache,
            snapshots,
            recovery,
        }
    }

    fn report(outcome: ConvergeOutcome) -> ConvergeReport {
        match outcome {
            ConvergeOutcome::Converged(report) => report,
            other => panic!("expected convergence, got {other:?}"),
        }
    }

    #[test]
    fn test_creates_missing_resource_and_caches_hash() {
        let box_a = boxed("boxA", json!({"image": "app:1"}));
        let h1 = box_a.hash().to_string();
        let f = fixture(vec![settings("sync"), box_a]);

        let report = report(f.engine.converge_tenant("alpha").unwrap());
        assert_eq!(report.created, 1);

        let key = ResourceKey::new("ns-alpha", ResourceKind::Box, "boxA");
        assert_eq!(f.cache.get(&key).unwrap().hash.as_deref(), Some(h1.as_str()));
        let live = f.cluster.resource(&key).unwrap();
        assert_eq!(live.source_hash(), Some(h1.as_str()));
        assert_eq!(live.commit_ref(), None);
    }

    #[test]
    fn test_second_pass_is_idempotent() {
        let f = fixture(vec![
            settings("rule"),
            boxed("boxA", json!({"a": 1})),
            RepositoryResource::new(ResourceKind::Link, "links", json!({"to": ["boxA"]})),
        ]);

        f.engine.converge_tenant("alpha").unwrap();
        let after_first = f.cluster.mutation_count();
        assert!(after_first > 0);

        let second = report(f.engine.converge_tenant("alpha").unwrap());
        assert_eq!(second.mutations(), 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(f.cluster.mutation_count(), after_first);
    }

    #[test]
    fn test_replaces_changed_and_deletes_extra() {
        let f = fixture(vec![settings("sync"), boxed("keep", json!({"v": 1})), boxed("gone", json!({}))]);
        f.engine.converge_tenant("alpha").unwrap();

        f.snapshots
            .set("c2", vec![settings("sync"), boxed("keep", json!({"v": 2}))]);
        let report = report(f.engine.converge_tenant("alpha").unwrap());
        assert_eq!((report.replaced, report.deleted, report.created), (1, 1, 0));

        let gone = ResourceKey::new("ns-alpha", ResourceKind::Box, "gone");
        assert!(f.cluster.resource(&gone).is_none());
        assert!(f.cache.get(&gone).unwrap().tombstoned);
    }

    #[test]
    fn test_failure_on_one_resource_does_not_stop_others() {
        let f = fixture(vec![
            settings("sync"),
            boxed("bad", json!({})),
            boxed("good", json!({})),
        ]);
        f.cluster.fail_on("bad");

        let report = report(f.engine.converge_tenant("alpha").unwrap());
        assert_eq!(report.failed, 1);
        assert_eq!(report.created, 1);
        assert!(f
            .cache
            .get(&ResourceKey::new("ns-alpha", ResourceKind::Box, "bad"))
            .is_none());
    }

    #[test]
    fn test_sync_disabled_is_skipped() {
        let f = fixture(vec![settings("off"), boxed("boxA", json!({}))]);
        assert_eq!(f.engine.converge_tenant("alpha").unwrap(), ConvergeOutcome::Skipped);
        assert_eq!(f.cluster.mutation_count(), 0);

        let f = fixture(vec![boxed("boxA", json!({}))]);
        assert_eq!(f.engine.converge_tenant("alpha").unwrap(), ConvergeOutcome::Skipped);
    }

    #[test]
    fn test_denied_propagation_removes_namespace() {
        let f = fixture(vec![settings("sync"), boxed("boxA", json!({}))]);
        f.engine.converge_tenant("alpha").unwrap();
        assert!(!f.cache.entries_for_namespace("ns-alpha").is_empty());

        f.snapshots.set("c2", vec![settings("deny"), boxed("boxA", json!({}))]);
        assert_eq!(
            f.engine.converge_tenant("alpha").unwrap(),
            ConvergeOutcome::NamespaceRemoved
        );
        assert!(f.cluster.namespaces().is_empty());
        assert!(f.cache.entries_for_namespace("ns-alpha").is_empty());
    }

    #[test]
    fn test_namespace_not_ready_defers_to_recovery() {
        let f = fixture(vec![settings("sync"), boxed("boxA", json!({}))]);
        f.cluster
            .set_namespace_phase("ns-alpha", NamespacePhase::Terminating);

        assert_eq!(f.engine.converge_tenant("alpha").unwrap(), ConvergeOutcome::Deferred);
        assert!(f.recovery.is_scheduled("alpha"));
        assert_eq!(f.cluster.mutation_count(), 0);
    }

    #[test]
    fn test_snapshot_failure_aborts_pass() {
        let f = fixture(vec![settings("sync")]);
        *f.snapshots.fail.lock().unwrap() = true;

        let err = f.engine.converge_tenant("alpha").unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.cluster.mutation_count(), 0);
        assert_eq!(f.snapshots.calls.load(Ordering::SeqCst), 1);
    }
}
