//! Crate-level error type.

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::config::ConfigError;
use crate::repository::RepositoryError;
use crate::scheduler::QueueError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Service is already running")]
    AlreadyRunning,

    #[error("Service has been stopped")]
    Stopped,
}

impl SyncError {
    /// Whether the next scheduled pass is expected to succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Repository(e) => e.is_retryable() || e.is_inconsistent(),
            SyncError::Cluster(ClusterError::NamespaceNotReady(_)) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
