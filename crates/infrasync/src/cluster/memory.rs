//! In-process cluster used by tests and local dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender};

use super::{
    ClusterClient, ClusterError, ClusterResource, NamespacePhase, Result, WatchAction, WatchEvent,
};
use crate::snapshot::{ResourceKey, ResourceKind};

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, NamespacePhase>,
    resources: BTreeMap<ResourceKey, ClusterResource>,
    next_version: u64,
}

/// A cluster held in memory.
///
/// Mutating calls made through [`ClusterClient`] are counted and emit watch
/// events like a real API server would. Changes made through the
/// `external_*` helpers simulate edits by other actors: they emit events but
/// are not counted.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
    watchers: Mutex<HashMap<ResourceKind, Vec<Sender<WatchEvent>>>>,
    mutations: AtomicUsize,
    failing: Mutex<HashSet<String>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of mutating calls made through the client interface.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn set_namespace_phase(&self, namespace: &str, phase: NamespacePhase) {
        self.state().namespaces.insert(namespace.to_string(), phase);
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.state().namespaces.keys().cloned().collect()
    }

    pub fn resource(&self, key: &ResourceKey) -> Option<ClusterResource> {
        self.state().resources.get(key).cloned()
    }

    /// Makes create and replace calls for resources with this name fail.
    pub fn fail_on(&self, name: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
    }

    /// Stores a resource as another actor would.
    pub fn external_apply(&self, resource: ClusterResource) {
        let action = self.store(resource.clone());
        self.notify(action, resource);
    }

    /// Deletes a resource as another actor would.
    pub fn external_delete(&self, key: &ResourceKey) {
        let removed = self.state().resources.remove(key);
        if let Some(resource) = removed {
            self.notify(WatchAction::Deleted, resource);
        }
    }

    fn store(&self, mut resource: ClusterResource) -> WatchAction {
        let mut state = self.state();
        state.next_version += 1;
        resource.resource_version = Some(state.next_version.to_string());
        match state.resources.insert(resource.key(), resource) {
            Some(_) => WatchAction::Modified,
            None => WatchAction::Added,
        }
    }

    fn notify(&self, action: WatchAction, resource: ClusterResource) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(senders) = watchers.get_mut(&resource.kind) {
            senders.retain(|tx| {
                tx.send(WatchEvent {
                    action,
                    resource: resource.clone(),
                })
                .is_ok()
            });
        }
    }

    fn count(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    fn check_failure(&self, resource: &ClusterResource) -> Result<()> {
        let failing = self.failing.lock().unwrap_or_else(|e| e.into_inner());
        if failing.contains(&resource.name) {
            return Err(ClusterError::Api(format!(
                "injected failure for {}",
                resource.key()
            )));
        }
        Ok(())
    }

    fn require_namespace(&self, namespace: &str) -> Result<()> {
        match self.state().namespaces.get(namespace) {
            Some(NamespacePhase::Active) => Ok(()),
            Some(_) => Err(ClusterError::NamespaceNotReady(namespace.to_string())),
            None => Err(ClusterError::NotFound(format!("namespace {}", namespace))),
        }
    }
}

impl ClusterClient for MemoryCluster {
    fn namespace_phase(&self, namespace: &str) -> Result<Option<NamespacePhase>> {
        Ok(self.state().namespaces.get(namespace).cloned())
    }

    fn create_namespace(&self, namespace: &str) -> Result<()> {
        self.count();
        let mut state = self.state();
        if state.namespaces.contains_key(namespace) {
            return Err(ClusterError::AlreadyExists(format!("namespace {}", namespace)));
        }
        state
            .namespaces
            .insert(namespace.to_string(), NamespacePhase::Active);
        Ok(())
    }

    fn delete_namespace(&self, namespace: &str) -> Result<()> {
        let removed: Vec<ClusterResource> = {
            let mut state = self.state();
            if state.namespaces.remove(namespace).is_none() {
                return Ok(());
            }
            let keys: Vec<ResourceKey> = state
                .resources
                .keys()
                .filter(|k| k.namespace == namespace)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|k| state.resources.remove(k))
                .collect()
        };
        self.count();
        for resource in removed {
            self.notify(WatchAction::Deleted, resource);
        }
        Ok(())
    }

    fn list_resources(&self, namespace: &str, kind: ResourceKind) -> Result<Vec<ClusterResource>> {
        Ok(self
            .state()
            .resources
            .values()
            .filter(|r| r.namespace == namespace && r.kind == kind)
            .cloned()
            .collect())
    }

    fn get_resource(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ClusterResource>> {
        let key = ResourceKey::new(namespace, kind, name);
        Ok(self.state().resources.get(&key).cloned())
    }

    fn create_resource(&self, resource: &ClusterResource) -> Result<()> {
        self.count();
        self.check_failure(resource)?;
        self.require_namespace(&resource.namespace)?;
        if self.state().resources.contains_key(&resource.key()) {
            return Err(ClusterError::AlreadyExists(resource.key().to_string()));
        }
        let action = self.store(resource.clone());
        self.notify(action, resource.clone());
        Ok(())
    }

    fn replace_resource(&self, resource: &ClusterResource) -> Result<()> {
        self.count();
        self.check_failure(resource)?;
        self.require_namespace(&resource.namespace)?;
        if !self.state().resources.contains_key(&resource.key()) {
            return Err(ClusterError::NotFound(resource.key().to_string()));
        }
        let action = self.store(resource.clone());
        self.notify(action, resource.clone());
        Ok(())
    }

    fn delete_resource(&self, namespace: &str, kind: ResourceKind, name: &str) -> Result<()> {
        self.count();
        let key = ResourceKey::new(namespace, kind, name);
        let removed = self.state().resources.remove(&key);
        match removed {
            Some(resource) => {
                self.notify(WatchAction::Deleted, resource);
                Ok(())
            }
            None => Err(ClusterError::NotFound(key.to_string())),
        }
    }

    fn watch(&self, kind: ResourceKind) -> Receiver<WatchEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push(tx);
        rx
    }
}
