//! In-memory map from live resource to the hash this process last applied or verified.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::snapshot::ResourceKey;

/// What this process last knew about a live resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftCacheEntry {
    /// `None` only for tombstones of resources never seen alive.
    pub hash: Option<String>,
    pub tombstoned: bool,
}

impl DriftCacheEntry {
    /// Whether a live object with `live_hash` is the state recorded here.
    pub fn matches_live(&self, live_hash: Option<&str>) -> bool {
        !self.tombstoned && self.hash.is_some() && self.hash.as_deref() == live_hash
    }

    /// Whether a delete of an object with `live_hash` was already recorded.
    pub fn matches_deleted(&self, live_hash: Option<&str>) -> bool {
        self.tombstoned && (self.hash.is_none() || self.hash.as_deref() == live_hash)
    }
}

/// Held while reading the cache, deciding, mutating the cluster and updating the cache for one key.
pub type KeyLock = Arc<Mutex<()>>;

/// Hash cache with per-resource locks, shared by the engine and the watcher.
#[derive(Debug, Default)]
pub struct DriftCache {
    entries: Mutex<HashMap<ResourceKey, DriftCacheEntry>>,
    locks: Mutex<HashMap<ResourceKey, KeyLock>>,
}

impl DriftCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ResourceKey, DriftCacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records `hash` as the live state of `key`, clearing any tombstone.
    pub fn add(&self, key: ResourceKey, hash: impl Into<String>) {
        self.entries().insert(
            key,
            DriftCacheEntry {
                hash: Some(hash.into()),
                tombstoned: false,
            },
        );
    }

    /// Marks `key` deleted while keeping its last hash.
    pub fn remove(&self, key: &ResourceKey) {
        let mut entries = self.entries();
        match entries.get_mut(key) {
            Some(entry) => entry.tombstoned = true,
            None => {
                entries.insert(
                    key.clone(),
                    DriftCacheEntry {
                        hash: None,
                        tombstoned: true,
                    },
                );
            }
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<DriftCacheEntry> {
        self.entries().get(key).cloned()
    }

    /// The lock serializing every action on `key`, created on first use.
    pub fn lock_for(&self, key: &ResourceKey) -> KeyLock {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    /// Evicts every entry of a namespace, and those of its locks nobody holds.
    ///
    /// A lock still referenced elsewhere stays mapped, so later callers of
    /// [`lock_for`](Self::lock_for) keep serializing against its holder.
    pub fn remove_namespace(&self, namespace: &str) {
        self.entries().retain(|k, _| k.namespace != namespace);
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|k, lock| k.namespace != namespace || Arc::strong_count(lock) > 1);
        log::debug!("Evicted drift cache entries of namespace '{}'", namespace);
    }

    /// Entries of one namespace, sorted by key.
    pub fn entries_for_namespace(&self, namespace: &str) -> Vec<(ResourceKey, DriftCacheEntry)> {
        let mut entries: Vec<(ResourceKey, DriftCacheEntry)> = self
            .entries()
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Acquires a key lock, recovering from poisoning.
pub fn hold(lock: &KeyLock) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}
