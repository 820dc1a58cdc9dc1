use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};

use super::queue::JobQueue;

/// Work performed for each job taken from the queue.
pub trait SyncHandler: Send + Sync {
    fn sync_tenant(&self, tenant: &str);
}

/// Fixed set of threads draining a [`JobQueue`].
pub struct SyncWorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl SyncWorkerPool {
    /// Starts `worker_count` workers.
    ///
    /// # Panics
    /// Panics if `worker_count` is 0.
    pub fn start(queue: Arc<JobQueue>, handler: Arc<dyn SyncHandler>, worker_count: usize) -> Self {
        assert!(worker_count > 0, "worker_count must be > 0");
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers = (0..worker_count)
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                let handler = Arc::clone(&handler);
                let shutdown = Arc::clone(&shutdown);
                thread::Builder::new()
                    .name(format!("sync-worker-{}", worker_id))
                    .spawn(move || run_worker(worker_id, queue, handler, shutdown))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!("Failed to spawn sync worker: {}", e);
                    None
                }
            })
            .collect::<Vec<_>>();

        info!("Started {} sync workers", workers.len());
        Self { workers, shutdown }
    }

    pub fn shutdown(&self) {
        info!("Shutting down sync workers...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Joins every worker. A pass already running finishes first.
    pub fn wait(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Sync worker {} panicked: {:?}", i, e);
            } else {
                debug!("Sync worker {} finished", i);
            }
        }
        info!("All sync workers have stopped");
    }
}

fn run_worker(
    worker_id: usize,
    queue: Arc<JobQueue>,
    handler: Arc<dyn SyncHandler>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Sync worker {} started", worker_id);

    while !shutdown.load(Ordering::Relaxed) {
        let Some(job) = queue.wait_for_job(Duration::from_millis(100)) else {
            continue;
        };

        debug!("Sync worker {} processing '{}'", worker_id, job.tenant);
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.sync_tenant(&job.tenant)));
        if outcome.is_err() {
            error!("Synchronization of '{}' panicked", job.tenant);
        }

        if let Err(e) = queue.complete_job(&job.tenant) {
            error!("Sync worker {}: {}", worker_id, e);
        }
    }

    debug!("Sync worker {} received shutdown signal", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        runs: Mutex<HashMap<String, usize>>,
        active: Mutex<Vec<String>>,
        overlap: AtomicBool,
    }

    impl SyncHandler for Recorder {
        fn sync_tenant(&self, tenant: &str) {
            {
                let mut active = self.active.lock().unwrap();
                if active.iter().any(|t| t == tenant) {
                    self.overlap.store(true, Ordering::SeqCst);
                }
                active.push(tenant.to_string());
            }
            thread::sleep(Duration::from_millis(5));
            self.active.lock().unwrap().retain(|t| t != tenant);
            *self.runs.lock().unwrap().entry(tenant.to_string()).or_default() += 1;
            if tenant == "boom" {
                panic!("handler failure");
            }
        }
    }

    fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_workers_process_jobs_without_overlap() {
        let queue = Arc::new(JobQueue::new());
        let recorder = Arc::new(Recorder::default());
        let pool = SyncWorkerPool::start(Arc::clone(&queue), recorder.clone(), 3);

        for i in 0..30 {
            queue.add_job(&format!("t{}", i % 4));
        }

        assert!(wait_until(Duration::from_secs(5), || {
            queue.pending_count() == 0 && queue.in_progress_count() == 0
        }));
        pool.wait();

        assert!(!recorder.overlap.load(Ordering::SeqCst));
        assert_eq!(recorder.runs.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_panicking_handler_releases_tenant() {
        let queue = Arc::new(JobQueue::new());
        let recorder = Arc::new(Recorder::default());
        let pool = SyncWorkerPool::start(Arc::clone(&queue), recorder.clone(), 1);

        queue.add_job("boom");
        assert!(wait_until(Duration::from_secs(5), || {
            recorder.runs.lock().unwrap().get("boom") == Some(&1)
                && !queue.is_in_progress("boom")
        }));

        queue.add_job("boom");
        assert!(wait_until(Duration::from_secs(5), || {
            recorder.runs.lock().unwrap().get("boom") == Some(&2)
        }));
        pool.wait();
    }
}
