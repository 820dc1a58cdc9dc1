//! Reverts out-of-band edits to managed resources.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;

use crate::cluster::{ClusterError, ClusterResource, WatchAction, WatchEvent};
use crate::drift::hold;
use crate::engine::ReconcileContext;
use crate::error::Result;
use crate::snapshot::{ResourceKey, ResourceKind};

/// What the watcher did about one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriftAction {
    /// The notification matched known state, or the tenant is not governed.
    Ignored,
    /// The desired resource was written back.
    Replaced,
    /// A resource absent from the repository was removed.
    Deleted,
    /// The namespace was not ready; a recovery was scheduled.
    Deferred,
}

/// Consumes watch notifications and restores the repository state.
pub struct DriftWatcher {
    ctx: ReconcileContext,
    shutdown: Arc<AtomicBool>,
}

impl DriftWatcher {
    pub fn new(ctx: ReconcileContext) -> Self {
        Self {
            ctx,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handles one notification.
    ///
    /// Notifications whose live hash matches the drift cache are dropped
    /// without touching the repository. Everything else is rechecked against
    /// a fresh snapshot under the resource's key lock.
    pub fn handle_event(&self, event: &WatchEvent) -> Result<DriftAction> {
        let key = event.resource.key();
        if !key.kind.is_managed() {
            return Ok(DriftAction::Ignored);
        }
        let Some(tenant) = self.ctx.namespaces.tenant_for(&key.namespace) else {
            return Ok(DriftAction::Ignored);
        };

        let lock = self.ctx.cache.lock_for(&key);
        let _held = hold(&lock);

        let live_hash = event.resource.source_hash();
        let deleted = event.action == WatchAction::Deleted;
        if let Some(entry) = self.ctx.cache.get(&key) {
            let known = if deleted {
                entry.matches_deleted(live_hash)
            } else {
                entry.matches_live(live_hash)
            };
            if known {
                return Ok(DriftAction::Ignored);
            }
        }

        let span = tracing::info_span!("drift", resource = %key);
        let _enter = span.enter();
        log::debug!("{:?} notification for {} diverges from cache", event.action, key);

        let snapshot = self.ctx.snapshots.snapshot(tenant)?;
        let governed = snapshot
            .settings
            .as_ref()
            .map(|s| s.is_governance_required())
            .unwrap_or(false);
        if !governed {
            return Ok(DriftAction::Ignored);
        }

        for resource in snapshot.managed() {
            self.ctx.cache.add(
                ResourceKey::new(&key.namespace, resource.kind, resource.name()),
                resource.hash(),
            );
        }

        let desired = snapshot.get(key.kind, &key.name);
        match desired {
            Some(desired) if !deleted && live_hash == Some(desired.hash()) => {
                return Ok(DriftAction::Ignored);
            }
            None if deleted => {
                self.ctx.cache.remove(&key);
                return Ok(DriftAction::Ignored);
            }
            _ => {}
        }

        let ready = self
            .ctx
            .cluster
            .namespace_phase(&key.namespace)?
            .map(|phase| phase.is_active())
            .unwrap_or(false);
        if !ready {
            self.ctx.recovery.schedule(tenant);
            return Ok(DriftAction::Deferred);
        }

        match desired {
            Some(desired) => {
                let resource = ClusterResource::from_repository(&key.namespace, desired);
                self.ctx.cluster.create_or_replace_resource(&resource)?;
                self.ctx.cache.add(key.clone(), desired.hash());
                log::info!("Reverted drift of {}", key);
                Ok(DriftAction::Replaced)
            }
            None => {
                match self
                    .ctx
                    .cluster
                    .delete_resource(&key.namespace, key.kind, &key.name)
                {
                    Ok(()) | Err(ClusterError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                self.ctx.cache.remove(&key);
                log::info!("Deleted unmanaged {}", key);
                Ok(DriftAction::Deleted)
            }
        }
    }

    /// Starts one watch thread per managed kind.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        ResourceKind::managed()
            .iter()
            .map(|kind| {
                let rx = self.ctx.cluster.watch(*kind);
                let watcher = Arc::clone(self);
                let kind = *kind;
                std::thread::spawn(move || watcher.run(kind, rx))
            })
            .collect()
    }

    fn run(&self, kind: ResourceKind, rx: Receiver<WatchEvent>) {
        log::debug!("Watching {} resources", kind);
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => {
                    if let Err(e) = self.handle_event(&event) {
                        log::error!(
                            "Failed to handle {:?} of {}: {}",
                            event.action,
                            event.resource.key(),
                            e
                        );
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    log::warn!("Watch stream for {} closed", kind);
                    break;
                }
            }
        }
        log::debug!("Stopped watching {} resources", kind);
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
