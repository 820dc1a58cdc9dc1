//! Turns routed events into synchronization jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use super::queue::JobQueue;
use crate::events::{EventRouter, TenantEvent};

/// Tenant that needs a convergence pass because of `event`, if any.
///
/// Repository updates already applied by their writer and status updates
/// do not trigger a pass.
pub fn tenant_to_sync(event: &TenantEvent) -> Option<&str> {
    match event {
        TenantEvent::SynchronizationRequest { tenant, .. } => Some(tenant),
        TenantEvent::RepositoryUpdate {
            tenant,
            already_applied: false,
            ..
        } => Some(tenant),
        TenantEvent::RepositoryUpdate { .. } | TenantEvent::StatusUpdate { .. } => None,
    }
}

/// Subscribes to the router and feeds the job queue.
pub struct EventDispatcher {
    router: Arc<EventRouter>,
    queue: Arc<JobQueue>,
    shutdown: Arc<AtomicBool>,
}

impl EventDispatcher {
    pub fn new(router: Arc<EventRouter>, queue: Arc<JobQueue>) -> Self {
        Self {
            router,
            queue,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribes immediately, then consumes events on a background thread.
    pub fn start(&self) -> JoinHandle<()> {
        let mut rx = self.router.subscribe();
        let router = Arc::clone(&self.router);
        let queue = Arc::clone(&self.queue);
        let shutdown = Arc::clone(&self.shutdown);

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Failed to start event dispatcher runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                loop {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        received = rx.recv() => {
                            if !handle_received(&router, &queue, received) {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            });
            log::debug!("Event dispatcher stopped");
        })
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

/// Returns false once the router is gone.
fn handle_received(
    router: &EventRouter,
    queue: &JobQueue,
    received: Result<TenantEvent, RecvError>,
) -> bool {
    match received {
        Ok(event) => {
            if let Some(tenant) = tenant_to_sync(&event) {
                log::debug!("{} for '{}' queues a sync", event.event_type(), tenant);
                queue.add_job(tenant);
            }
            true
        }
        Err(RecvError::Lagged(missed)) => {
            // Dropped events may have been sync requests; resync everyone we know of.
            log::warn!(
                "Event dispatcher missed {} events, requesting sync of all known tenants",
                missed
            );
            for tenant in router.cached_tenants() {
                queue.add_job(&tenant);
            }
            true
        }
        Err(RecvError::Closed) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_tenant_to_sync() {
        assert_eq!(
            tenant_to_sync(&TenantEvent::synchronization_request("a")),
            Some("a")
        );
        assert_eq!(
            tenant_to_sync(&TenantEvent::repository_update("a", "c1", false)),
            Some("a")
        );
        assert_eq!(
            tenant_to_sync(&TenantEvent::repository_update("a", "c1", true)),
            None
        );
        assert_eq!(
            tenant_to_sync(&TenantEvent::StatusUpdate {
                tenant: "a".into(),
                resource: "r".into(),
                status: "s".into(),
            }),
            None
        );
    }

    #[test]
    fn test_dispatcher_queues_jobs() {
        let router = Arc::new(EventRouter::new(512, 64));
        let queue = Arc::new(JobQueue::new());
        let dispatcher = EventDispatcher::new(Arc::clone(&router), Arc::clone(&queue));
        let handle = dispatcher.start();

        router.publish(TenantEvent::repository_update("alpha", "c1", false));
        router.publish(TenantEvent::repository_update("beta", "c1", true));
        router.publish(TenantEvent::synchronization_request("gamma"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.pending_count() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        dispatcher.stop();
        handle.join().expect("dispatcher thread panicked");

        assert!(queue.is_pending("alpha"));
        assert!(!queue.is_pending("beta"));
        assert!(queue.is_pending("gamma"));
    }

    #[test]
    fn test_lag_requests_all_cached_tenants() {
        let router = EventRouter::new(512, 64);
        let queue = JobQueue::new();
        for tenant in ["t0", "t1", "t2"] {
            router.publish(TenantEvent::repository_update(tenant, "c1", true));
        }

        assert!(handle_received(&router, &queue, Err(RecvError::Lagged(7))));
        for tenant in ["t0", "t1", "t2"] {
            assert!(queue.is_pending(tenant), "missing job for {tenant}");
        }
        assert!(!handle_received(&router, &queue, Err(RecvError::Closed)));
    }
}
