//! Last-applied state of live resources.

pub mod cache;

pub use cache::{hold, DriftCache, DriftCacheEntry, KeyLock};
