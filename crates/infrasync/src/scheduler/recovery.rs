//! Delayed re-synchronization of tenants whose namespace was not ready.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cluster::ClusterClient;
use crate::config::ClusterConfig;
use crate::events::{EventRouter, TenantEvent};

const IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Tasks {
    due: BinaryHeap<Reverse<(Instant, String)>>,
    scheduled: HashSet<String>,
}

struct Shared {
    tasks: Mutex<Tasks>,
    wake: Condvar,
    shutdown: AtomicBool,
    delay: Duration,
    cluster: Arc<dyn ClusterClient>,
    router: Arc<EventRouter>,
    namespaces: ClusterConfig,
}

/// Retries tenants after a fixed delay until their namespace is active.
///
/// At most one task per tenant exists at a time. When a task fires and the
/// namespace is ready (or gone), a synchronization request is published and
/// the task is dropped; otherwise it is rescheduled.
pub struct RecoveryScheduler {
    shared: Arc<Shared>,
}

impl RecoveryScheduler {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        router: Arc<EventRouter>,
        namespaces: ClusterConfig,
        delay: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                tasks: Mutex::new(Tasks::default()),
                wake: Condvar::new(),
                shutdown: AtomicBool::new(false),
                delay,
                cluster,
                router,
                namespaces,
            }),
        }
    }

    /// Schedules a recovery for `tenant`. Returns false if one is already scheduled.
    pub fn schedule(&self, tenant: &str) -> bool {
        let scheduled = self.shared.schedule(tenant);
        if scheduled {
            log::info!(
                "Scheduled recovery of '{}' in {:?}",
                tenant,
                self.shared.delay
            );
        }
        scheduled
    }

    pub fn is_scheduled(&self, tenant: &str) -> bool {
        self.shared.tasks().scheduled.contains(tenant)
    }

    pub fn scheduled_count(&self) -> usize {
        self.shared.tasks().scheduled.len()
    }

    /// Runs every task that is due now. Returns how many ran.
    pub fn run_due(&self) -> usize {
        self.shared.run_due()
    }

    /// Starts the timer thread.
    pub fn start(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || {
            while !shared.shutdown.load(Ordering::Acquire) {
                shared.run_due();

                let tasks = shared.tasks();
                let wait = tasks
                    .due
                    .peek()
                    .map(|Reverse((at, _))| at.saturating_duration_since(Instant::now()))
                    .unwrap_or(IDLE_WAIT)
                    .min(IDLE_WAIT);
                if !wait.is_zero() {
                    let _unused = shared
                        .wake
                        .wait_timeout(tasks, wait)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
            log::debug!("Recovery scheduler stopped");
        })
    }

    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_all();
    }
}

impl Shared {
    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn schedule(&self, tenant: &str) -> bool {
        let mut tasks = self.tasks();
        if !tasks.scheduled.insert(tenant.to_string()) {
            return false;
        }
        tasks
            .due
            .push(Reverse((Instant::now() + self.delay, tenant.to_string())));
        drop(tasks);
        self.wake.notify_all();
        true
    }

    fn take_due(&self) -> Vec<String> {
        let now = Instant::now();
        let mut tasks = self.tasks();
        let mut due = Vec::new();
        while tasks
            .due
            .peek()
            .map(|Reverse((at, _))| *at <= now)
            .unwrap_or(false)
        {
            if let Some(Reverse((_, tenant))) = tasks.due.pop() {
                due.push(tenant);
            }
        }
        due
    }

    fn run_due(&self) -> usize {
        let due = self.take_due();
        for tenant in &due {
            if self.attempt(tenant) {
                self.tasks().scheduled.remove(tenant);
            } else {
                self.tasks()
                    .due
                    .push(Reverse((Instant::now() + self.delay, tenant.clone())));
            }
        }
        due.len()
    }

    /// Returns true when the task is finished.
    fn attempt(&self, tenant: &str) -> bool {
        let namespace = self.namespaces.namespace_for(tenant);
        match self.cluster.namespace_phase(&namespace) {
            Ok(Some(phase)) if !phase.is_active() => {
                log::info!(
                    "Namespace '{}' still {}, retrying recovery of '{}' later",
                    namespace,
                    phase,
                    tenant
                );
                false
            }
            Ok(_) => {
                log::info!("Requesting synchronization of '{}' after recovery", tenant);
                self.router
                    .publish(TenantEvent::synchronization_request(tenant));
                true
            }
            Err(e) => {
                log::warn!("Recovery of '{}' failed: {}", tenant, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MemoryCluster, NamespacePhase};
    use crate::events::EventType;

    fn scheduler(cluster: Arc<MemoryCluster>, delay: Duration) -> (RecoveryScheduler, Arc<EventRouter>) {
        let router = Arc::new(EventRouter::new(512, 64));
        let scheduler = RecoveryScheduler::new(
            cluster,
            Arc::clone(&router),
            ClusterConfig::default(),
            delay,
        );
        (scheduler, router)
    }

    #[test]
    fn test_schedule_is_unique_per_tenant() {
        let cluster = Arc::new(MemoryCluster::new());
        let (scheduler, _) = scheduler(cluster, Duration::from_secs(60));
        assert!(scheduler.schedule("alpha"));
        assert!(!scheduler.schedule("alpha"));
        assert!(scheduler.schedule("beta"));
        assert_eq!(scheduler.scheduled_count(), 2);
        assert_eq!(scheduler.run_due(), 0);
    }

    #[test]
    fn test_not_ready_namespace_is_retried() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.set_namespace_phase("ns-alpha", NamespacePhase::Terminating);
        let (scheduler, router) = scheduler(Arc::clone(&cluster), Duration::ZERO);
        let mut rx = router.subscribe();

        scheduler.schedule("alpha");
        assert_eq!(scheduler.run_due(), 1);
        assert!(scheduler.is_scheduled("alpha"));
        assert!(rx.try_recv().is_err());

        cluster.set_namespace_phase("ns-alpha", NamespacePhase::Active);
        assert_eq!(scheduler.run_due(), 1);
        assert!(!scheduler.is_scheduled("alpha"));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.tenant(), "alpha");
        assert_eq!(event.event_type(), EventType::SynchronizationRequest);
    }

    #[test]
    fn test_missing_namespace_requests_sync() {
        let cluster = Arc::new(MemoryCluster::new());
        let (scheduler, router) = scheduler(cluster, Duration::ZERO);
        let mut rx = router.subscribe();

        scheduler.schedule("alpha");
        scheduler.run_due();
        assert_eq!(rx.try_recv().unwrap().tenant(), "alpha");
    }

    #[test]
    fn test_thread_fires_and_stops() {
        let cluster = Arc::new(MemoryCluster::new());
        let (scheduler, router) = scheduler(cluster, Duration::from_millis(20));
        let mut rx = router.subscribe();
        let handle = scheduler.start();

        scheduler.schedule("alpha");
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut received = None;
        while received.is_none() && Instant::now() < deadline {
            received = rx.try_recv().ok();
            std::thread::sleep(Duration::from_millis(10));
        }

        scheduler.stop();
        handle.join().expect("recovery thread panicked");
        assert_eq!(received.map(|e| e.tenant().to_string()).as_deref(), Some("alpha"));
    }
}
