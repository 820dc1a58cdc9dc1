//! Explicit wiring of every component into one running service.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cluster::{ClusterClient, NamespaceBootstrap};
use crate::config::ManagerConfig;
use crate::drift::DriftCache;
use crate::engine::{ConvergeOutcome, ReconcileContext, ReconciliationEngine};
use crate::error::{Result, SyncError};
use crate::events::{EventRouter, TenantEvent};
use crate::poller::BranchPoller;
use crate::repository::{BranchSource, RepositoryContext, TenantRepository};
use crate::scheduler::{EventDispatcher, JobQueue, RecoveryScheduler, SyncWorkerPool};
use crate::snapshot::{RepositorySnapshot, SnapshotSource};
use crate::watcher::DriftWatcher;

enum State {
    Idle,
    Running {
        pool: SyncWorkerPool,
        threads: Vec<JoinHandle<()>>,
    },
    Stopped,
}

/// The synchronization service for one remote repository and one cluster.
///
/// Construction only wires components together; nothing runs until
/// [`start`](Self::start). A stopped service cannot be started again.
pub struct SyncService {
    config: ManagerConfig,
    repository: Arc<RepositoryContext>,
    router: Arc<EventRouter>,
    queue: Arc<JobQueue>,
    cache: Arc<DriftCache>,
    recovery: Arc<RecoveryScheduler>,
    engine: Arc<ReconciliationEngine>,
    watcher: Arc<DriftWatcher>,
    poller: Arc<BranchPoller>,
    dispatcher: EventDispatcher,
    state: Mutex<State>,
}

impl SyncService {
    pub fn new(
        config: ManagerConfig,
        cluster: Arc<dyn ClusterClient>,
        bootstrap: Arc<dyn NamespaceBootstrap>,
    ) -> Result<Self> {
        config.validate()?;
        let behaviour = &config.behaviour;

        let repository = Arc::new(RepositoryContext::new(config.git.clone()));
        let router = Arc::new(EventRouter::new(
            behaviour.event_cache_capacity,
            behaviour.event_channel_capacity,
        ));
        let queue = Arc::new(JobQueue::new());
        let cache = Arc::new(DriftCache::new());
        let recovery = Arc::new(RecoveryScheduler::new(
            Arc::clone(&cluster),
            Arc::clone(&router),
            config.cluster.clone(),
            Duration::from_secs(behaviour.recovery_delay_secs),
        ));

        let ctx = ReconcileContext {
            snapshots: Arc::clone(&repository) as Arc<dyn SnapshotSource>,
            cluster: Arc::clone(&cluster),
            cache: Arc::clone(&cache),
            recovery: Arc::clone(&recovery),
            namespaces: config.cluster.clone(),
        };
        let engine = Arc::new(ReconciliationEngine::new(ctx.clone(), bootstrap));
        let watcher = Arc::new(DriftWatcher::new(ctx));
        let poller = Arc::new(BranchPoller::new(
            Arc::clone(&repository) as Arc<dyn BranchSource>,
            Arc::clone(&router),
            Arc::clone(&cache),
            cluster,
            config.cluster.clone(),
            behaviour.template_branch.clone(),
            Duration::from_secs(behaviour.fetch_interval_secs),
        ));
        let dispatcher = EventDispatcher::new(Arc::clone(&router), Arc::clone(&queue));

        Ok(Self {
            config,
            repository,
            router,
            queue,
            cache,
            recovery,
            engine,
            watcher,
            poller,
            dispatcher,
            state: Mutex::new(State::Idle),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts every background component.
    ///
    /// The dispatcher subscribes before the poller runs, so the initial
    /// repository updates are never missed.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state();
        match *state {
            State::Running { .. } => return Err(SyncError::AlreadyRunning),
            State::Stopped => return Err(SyncError::Stopped),
            State::Idle => {}
        }

        let mut threads = vec![self.dispatcher.start(), self.recovery.start()];
        threads.extend(self.watcher.start());
        let pool = SyncWorkerPool::start(
            Arc::clone(&self.queue),
            Arc::clone(&self.engine) as Arc<dyn crate::scheduler::SyncHandler>,
            self.config.behaviour.sync_workers,
        );
        threads.push(self.poller.start());

        log::info!(
            "Synchronization service started for {}",
            self.config.git.remote_repository
        );
        *state = State::Running { pool, threads };
        Ok(())
    }

    /// Stops every component and waits for running passes to finish.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state(), State::Stopped);
        let State::Running { pool, threads } = previous else {
            return;
        };

        self.poller.stop();
        self.dispatcher.stop();
        self.watcher.stop();
        self.recovery.stop();
        pool.shutdown();

        for handle in threads {
            if let Err(e) = handle.join() {
                log::error!("Service thread panicked: {:?}", e);
            }
        }
        pool.wait();
        log::info!("Synchronization service stopped");
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state(), State::Running { .. })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Current snapshot of a tenant branch.
    pub fn snapshot(&self, tenant: &str) -> Result<RepositorySnapshot> {
        Ok(self.repository.snapshot(tenant)?)
    }

    /// Tenant branch to head commit, without the template branch.
    pub fn tenants(&self) -> Result<BTreeMap<String, String>> {
        let mut heads = self.repository.list_branch_commits()?;
        heads.remove(&self.config.behaviour.template_branch);
        Ok(heads)
    }

    /// The repository handle used to change a tenant's desired state.
    pub fn repository(&self, tenant: &str) -> Arc<TenantRepository> {
        self.repository.handle(tenant)
    }

    /// Creates a tenant branch from the template branch and announces it.
    pub fn create_tenant(&self, tenant: &str) -> Result<String> {
        let handle = self.repository.handle(tenant);
        let commit = handle
            .lock()
            .create_branch(&self.config.behaviour.template_branch)?;
        self.notify_repository_changed(tenant, &commit, false);
        Ok(commit)
    }

    /// Announces a new commit on a tenant branch.
    ///
    /// `already_applied` marks changes whose writer already converged the
    /// cluster, so no job is queued for them. Returns false if the commit
    /// was announced recently.
    pub fn notify_repository_changed(
        &self,
        tenant: &str,
        commit_ref: &str,
        already_applied: bool,
    ) -> bool {
        self.router.publish_if_not_cached(TenantEvent::repository_update(
            tenant,
            commit_ref,
            already_applied,
        ))
    }

    /// Asks for a convergence pass of `tenant`.
    pub fn request_sync(&self, tenant: &str) {
        self.router
            .publish(TenantEvent::synchronization_request(tenant));
    }

    /// Converges a tenant on the calling thread.
    pub fn converge_now(&self, tenant: &str) -> Result<ConvergeOutcome> {
        self.engine.converge_tenant(tenant)
    }

    /// Polls the remote ahead of the fetch interval.
    pub fn trigger_poll(&self) {
        self.poller.trigger();
    }

    pub fn drift_cache(&self) -> &DriftCache {
        &self.cache
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.stop();
    }
}
