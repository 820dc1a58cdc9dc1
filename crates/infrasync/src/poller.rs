//! Periodic discovery of tenant branches and their head commits.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::cluster::ClusterClient;
use crate::config::ClusterConfig;
use crate::drift::DriftCache;
use crate::error::Result;
use crate::events::{EventRouter, TenantEvent};
use crate::repository::BranchSource;

/// Tenants affected by one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollReport {
    /// Tenants for which a repository update was published.
    pub updated: Vec<String>,
    /// Tenants whose branch disappeared and whose namespace was removed.
    pub removed: Vec<String>,
}

/// Polls the remote for branch heads and publishes repository updates.
///
/// The first poll publishes an update for every tenant branch; later polls
/// only for branches whose head moved. Branches that disappear have their
/// namespace, drift cache entries and local clone removed.
pub struct BranchPoller {
    branches: Arc<dyn BranchSource>,
    router: Arc<EventRouter>,
    cache: Arc<DriftCache>,
    cluster: Arc<dyn ClusterClient>,
    namespaces: ClusterConfig,
    template_branch: String,
    interval: Duration,
    /// `None` until the first successful poll.
    known: Mutex<Option<BTreeMap<String, String>>>,
    shutdown: Arc<AtomicBool>,
    trigger: broadcast::Sender<()>,
}

impl BranchPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        branches: Arc<dyn BranchSource>,
        router: Arc<EventRouter>,
        cache: Arc<DriftCache>,
        cluster: Arc<dyn ClusterClient>,
        namespaces: ClusterConfig,
        template_branch: impl Into<String>,
        interval: Duration,
    ) -> Self {
        let (trigger, _) = broadcast::channel(16);
        Self {
            branches,
            router,
            cache,
            cluster,
            namespaces,
            template_branch: template_branch.into(),
            interval,
            known: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            trigger,
        }
    }

    /// Runs one poll.
    pub fn poll_once(&self) -> Result<PollReport> {
        let mut heads = self.branches.branch_commits()?;
        heads.remove(&self.template_branch);

        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        let first = known.is_none();
        let previous = known.take().unwrap_or_default();
        let mut report = PollReport::default();

        for (tenant, commit) in &heads {
            if !first && previous.get(tenant) == Some(commit) {
                continue;
            }
            let event = TenantEvent::repository_update(tenant.as_str(), commit.as_str(), false);
            if self.router.publish_if_not_cached(event) {
                log::info!("Branch '{}' moved to {}", tenant, commit);
                report.updated.push(tenant.clone());
            }
        }

        let mut next = heads;
        for (tenant, commit) in previous {
            if next.contains_key(&tenant) {
                continue;
            }
            if self.remove_tenant(&tenant) {
                report.removed.push(tenant);
            } else {
                // Retried on the next poll.
                next.insert(tenant, commit);
            }
        }

        *known = Some(next);
        Ok(report)
    }

    fn remove_tenant(&self, tenant: &str) -> bool {
        let namespace = self.namespaces.namespace_for(tenant);
        log::info!("Branch '{}' disappeared, removing namespace '{}'", tenant, namespace);
        if let Err(e) = self.cluster.delete_namespace(&namespace) {
            log::error!("Failed to delete namespace '{}': {}", namespace, e);
            return false;
        }
        self.cache.remove_namespace(&namespace);
        self.router.remove_tenant(tenant);
        self.branches.forget_branch(tenant);
        true
    }

    /// Starts polling in a background thread. The first poll runs immediately.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        let mut trigger_rx = self.trigger.subscribe();

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Failed to start branch poller runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                let mut interval_timer = tokio::time::interval(poller.interval);

                loop {
                    tokio::select! {
                        _ = interval_timer.tick() => {},
                        Ok(()) = trigger_rx.recv() => {
                            log::debug!("Branch poll triggered");
                        },
                    }

                    if poller.shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    match poller.poll_once() {
                        Ok(report) if !report.updated.is_empty() || !report.removed.is_empty() => {
                            log::debug!(
                                "Branch poll: {} updated, {} removed",
                                report.updated.len(),
                                report.removed.len()
                            );
                        }
                        Ok(_) => {}
                        Err(e) if e.is_retryable() => log::warn!("Branch poll failed: {}", e),
                        Err(e) => log::error!("Branch poll failed: {}", e),
                    }
                }
            });
            log::debug!("Branch poller stopped");
        })
    }

    /// Requests a poll ahead of the interval.
    pub fn trigger(&self) {
        let _ = self.trigger.send(());
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.trigger();
    }
}
