//! Job scheduling: the deduplicating queue, its worker pool, the event
//! dispatcher that feeds it and the delayed recovery timer.

pub mod dispatch;
pub mod pool;
pub mod queue;
pub mod recovery;

pub use dispatch::EventDispatcher;
pub use pool::{SyncHandler, SyncWorkerPool};
pub use queue::{JobQueue, QueueError, SyncJob};
pub use recovery::RecoveryScheduler;
