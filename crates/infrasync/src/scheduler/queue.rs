//! Deduplicating queue of tenant synchronization jobs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("No job in progress for tenant '{0}'")]
    NotInProgress(String),
}

/// A request to converge one tenant. Its identity is the tenant name.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub tenant: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    fn new(tenant: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            created_at: Utc::now(),
            started_at: None,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<SyncJob>,
    in_progress: HashMap<String, SyncJob>,
}

/// Pending jobs in arrival order plus the set of tenants being processed.
///
/// A tenant is pending at most once, and is handed out at most once until
/// [`complete_job`](JobQueue::complete_job) is called for it. A request that
/// arrives while the tenant is in progress stays pending and becomes
/// available after completion.
#[derive(Debug, Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues a job for `tenant`. Returns false if one is already pending.
    pub fn add_job(&self, tenant: &str) -> bool {
        let mut state = self.state();
        if state.pending.iter().any(|job| job.tenant == tenant) {
            log::debug!("Job for '{}' already pending", tenant);
            return false;
        }
        state.pending.push_back(SyncJob::new(tenant));
        drop(state);

        log::debug!("Queued job for '{}'", tenant);
        self.available.notify_one();
        true
    }

    /// Hands out the oldest pending job whose tenant is not in progress.
    ///
    /// Jobs skipped because their tenant is busy move to the back of the
    /// queue. Each pending job is looked at no more than once per call.
    pub fn take_job(&self) -> Option<SyncJob> {
        let mut state = self.state();
        Self::take_locked(&mut state)
    }

    fn take_locked(state: &mut QueueState) -> Option<SyncJob> {
        for _ in 0..state.pending.len() {
            let mut job = state.pending.pop_front()?;
            if state.in_progress.contains_key(&job.tenant) {
                state.pending.push_back(job);
                continue;
            }
            job.started_at = Some(Utc::now());
            state.in_progress.insert(job.tenant.clone(), job.clone());
            log::debug!("Took job for '{}'", job.tenant);
            return Some(job);
        }
        None
    }

    /// Like [`take_job`](Self::take_job), waiting up to `timeout` for one to become available.
    pub fn wait_for_job(&self, timeout: Duration) -> Option<SyncJob> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if let Some(job) = Self::take_locked(&mut state) {
                return Some(job);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = self
                .available
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Marks the tenant's job finished, unblocking any request queued meanwhile.
    pub fn complete_job(&self, tenant: &str) -> Result<SyncJob, QueueError> {
        let mut state = self.state();
        let job = state
            .in_progress
            .remove(tenant)
            .ok_or_else(|| QueueError::NotInProgress(tenant.to_string()))?;
        let follow_up = state.pending.iter().any(|job| job.tenant == tenant);
        drop(state);

        log::debug!("Completed job for '{}'", tenant);
        if follow_up {
            self.available.notify_one();
        }
        Ok(job)
    }

    pub fn is_pending(&self, tenant: &str) -> bool {
        self.state().pending.iter().any(|job| job.tenant == tenant)
    }

    pub fn is_in_progress(&self, tenant: &str) -> bool {
        self.state().in_progress.contains_key(tenant)
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn in_progress_count(&self) -> usize {
        self.state().in_progress.len()
    }
}
