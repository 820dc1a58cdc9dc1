pub mod cluster;
pub mod config;
pub mod drift;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod poller;
pub mod repository;
pub mod scheduler;
pub mod secrets;
pub mod service;
pub mod snapshot;
pub mod watcher;

pub use cluster::{
    ClusterClient, ClusterError, ClusterResource, DefaultBootstrap, MemoryCluster, NamespaceBootstrap,
};
pub use config::{load_config, load_config_from_str, ConfigError, ManagerConfig};
pub use drift::{DriftCache, DriftCacheEntry};
pub use engine::{ConvergeOutcome, ConvergeReport, ReconcileContext, ReconciliationEngine};
pub use error::{Result, SyncError};
pub use events::{EventRouter, EventType, TenantEvent};
pub use logging::{init_json_logging, init_logging};
pub use poller::{BranchPoller, PollReport};
pub use repository::{RepositoryContext, RepositoryError, RepositoryGuard, TenantRepository};
pub use scheduler::{JobQueue, RecoveryScheduler, SyncWorkerPool};
pub use secrets::{resolve_secret, SecretError};
pub use service::SyncService;
pub use snapshot::{
    RepositoryResource, RepositorySnapshot, ResourceKey, ResourceKind, SnapshotSource,
};
pub use watcher::{DriftAction, DriftWatcher};
