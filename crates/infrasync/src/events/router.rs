//! In-process pub/sub for tenant events with a bounded recently-seen cache.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;

use super::{EventType, TenantEvent};

/// Recently published dedup keys for one (tenant, event type), oldest first.
#[derive(Debug)]
struct EventCache {
    keys: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl EventCache {
    fn new(capacity: usize) -> Self {
        Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn insert(&mut self, key: String) {
        if !self.keys.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
    }
}

type CacheKey = (String, EventType);

/// Distributes [`TenantEvent`]s to every subscriber.
///
/// The channel is bounded: a subscriber that falls behind loses the oldest
/// events and observes `RecvError::Lagged` on its next receive.
pub struct EventRouter {
    sender: broadcast::Sender<TenantEvent>,
    caches: Mutex<HashMap<CacheKey, EventCache>>,
    cache_capacity: usize,
}

impl EventRouter {
    pub fn new(cache_capacity: usize, channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            sender,
            caches: Mutex::new(HashMap::new()),
            cache_capacity: cache_capacity.max(1),
        }
    }

    fn caches(&self) -> MutexGuard<'_, HashMap<CacheKey, EventCache>> {
        self.caches.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TenantEvent> {
        self.sender.subscribe()
    }

    /// Whether an event with the same tenant, type and dedup key was published recently.
    pub fn is_cached(&self, event: &TenantEvent) -> bool {
        let key = (event.tenant().to_string(), event.event_type());
        self.caches()
            .get(&key)
            .map(|cache| cache.contains(&event.dedup_key()))
            .unwrap_or(false)
    }

    /// Publishes unconditionally and records the event as seen.
    pub fn publish(&self, event: TenantEvent) {
        self.remember(&event);
        self.send(event);
    }

    /// Publishes only if the event was not seen recently. Returns whether it was published.
    pub fn publish_if_not_cached(&self, event: TenantEvent) -> bool {
        {
            let mut caches = self.caches();
            let cache = caches
                .entry((event.tenant().to_string(), event.event_type()))
                .or_insert_with(|| EventCache::new(self.cache_capacity));
            let dedup_key = event.dedup_key();
            if cache.contains(&dedup_key) {
                log::debug!(
                    "Dropping duplicate {} for '{}' ({})",
                    event.event_type(),
                    event.tenant(),
                    dedup_key
                );
                return false;
            }
            cache.insert(dedup_key);
        }
        self.send(event);
        true
    }

    /// Forgets every cached event of a tenant.
    pub fn remove_tenant(&self, tenant: &str) {
        self.caches().retain(|(t, _), _| t != tenant);
    }

    /// Tenants with at least one cached event, sorted.
    pub fn cached_tenants(&self) -> Vec<String> {
        self.caches()
            .keys()
            .map(|(tenant, _)| tenant.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn remember(&self, event: &TenantEvent) {
        self.caches()
            .entry((event.tenant().to_string(), event.event_type()))
            .or_insert_with(|| EventCache::new(self.cache_capacity))
            .insert(event.dedup_key());
    }

    fn send(&self, event: TenantEvent) {
        log::debug!("Publishing {} for '{}'", event.event_type(), event.tenant());
        if self.sender.send(event).is_err() {
            log::debug!("No subscribers for published event");
        }
    }
}
