use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use foundation::time::{Clock, Timestamp};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::request::CacheKey;
use crate::store::{CacheStore, StoredEntry};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryBudget {
    pub max_bytes: usize,
}

impl MemoryBudget {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

#[derive(Debug, Clone)]
struct HotEntry {
    data: Arc<Value>,
    stored_at: Timestamp,
    ttl_ms: u64,
    bytes: usize,
    last_used_tick: u64,
}

impl HotEntry {
    fn is_expired(&self, now: Timestamp) -> bool {
        now.millis_since(self.stored_at) > self.ttl_ms
    }
}

/// Byte-budgeted memory layer.
///
/// Entries are keyed in a `BTreeMap` so eviction is deterministic: LRU by
/// `last_used_tick`, ties broken by key order.
#[derive(Debug)]
struct HotLayer {
    budget: MemoryBudget,
    used_bytes: usize,
    tick: u64,
    entries: BTreeMap<CacheKey, HotEntry>,
}

impl HotLayer {
    fn get(&mut self, key: &CacheKey, now: Timestamp) -> Option<Arc<Value>> {
        let expired = self.entries.get(key)?.is_expired(now);
        if expired {
            self.remove(key);
            return None;
        }
        self.tick += 1;
        let entry = self.entries.get_mut(key)?;
        entry.last_used_tick = self.tick;
        Some(entry.data.clone())
    }

    fn insert(&mut self, key: CacheKey, mut entry: HotEntry) -> Vec<CacheKey> {
        if entry.bytes > self.budget.max_bytes {
            debug!(%key, bytes = entry.bytes, max = self.budget.max_bytes, "entry exceeds memory budget; not kept hot");
            self.remove(&key);
            return Vec::new();
        }
        self.tick += 1;
        entry.last_used_tick = self.tick;
        self.used_bytes += entry.bytes;
        if let Some(old) = self.entries.insert(key.clone(), entry) {
            self.used_bytes = self.used_bytes.saturating_sub(old.bytes);
        }
        self.evict_as_needed(&key)
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(old) => {
                self.used_bytes = self.used_bytes.saturating_sub(old.bytes);
                true
            }
            None => false,
        }
    }

    fn evict_as_needed(&mut self, protected: &CacheKey) -> Vec<CacheKey> {
        let mut evicted = Vec::new();
        while self.used_bytes > self.budget.max_bytes {
            let candidate = self
                .entries
                .iter()
                .filter(|(k, _)| *k != protected)
                .min_by(|(ka, ea), (kb, eb)| {
                    ea.last_used_tick
                        .cmp(&eb.last_used_tick)
                        .then_with(|| ka.cmp(kb))
                })
                .map(|(k, _)| k.clone());
            let Some(key) = candidate else {
                break;
            };
            self.remove(&key);
            evicted.push(key);
        }
        evicted
    }
}

/// Two-level TTL cache: a memory hot layer over a persistent `CacheStore`.
///
/// Evicting from memory never deletes the persistent copy. Expired entries
/// found in either layer are removed and reported as a miss. Store failures
/// are logged and treated as misses.
pub struct TtlCache {
    hot: Mutex<HotLayer>,
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TtlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hot = self.hot.lock();
        f.debug_struct("TtlCache")
            .field("budget", &hot.budget)
            .field("used_bytes", &hot.used_bytes)
            .field("entries", &hot.entries.len())
            .finish()
    }
}

impl TtlCache {
    pub fn new(budget: MemoryBudget, store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            hot: Mutex::new(HotLayer {
                budget,
                used_bytes: 0,
                tick: 0,
                entries: BTreeMap::new(),
            }),
            store,
            clock,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn used_bytes(&self) -> usize {
        self.hot.lock().used_bytes
    }

    pub fn hot_len(&self) -> usize {
        self.hot.lock().entries.len()
    }

    pub fn contains_hot(&self, key: &CacheKey) -> bool {
        self.hot.lock().entries.contains_key(key)
    }

    /// Memory-layer lookup only. Never suspends.
    pub fn get_hot(&self, key: &CacheKey) -> Option<Arc<Value>> {
        let now = self.clock.now();
        self.hot.lock().get(key, now)
    }

    /// Memory layer first, then the persistent store. A persistent hit is
    /// promoted into memory with its original timestamp.
    pub async fn get(&self, key: &CacheKey) -> Option<Arc<Value>> {
        if let Some(data) = self.get_hot(key) {
            return Some(data);
        }

        let storage_key = key.storage_key();
        let stored = match self.store.get(&storage_key).await {
            Ok(stored) => stored?,
            Err(e) => {
                warn!(%key, error = %e, "cache store read failed");
                return None;
            }
        };

        if stored.is_expired(self.clock.now()) {
            debug!(%key, "persistent entry expired");
            if let Err(e) = self.store.remove(&storage_key).await {
                warn!(%key, error = %e, "cache store remove failed");
            }
            return None;
        }

        let data = Arc::new(stored.payload);
        self.hot.lock().insert(
            key.clone(),
            HotEntry {
                data: data.clone(),
                stored_at: stored.stored_at,
                ttl_ms: stored.ttl_ms,
                bytes: stored.bytes,
                last_used_tick: 0,
            },
        );
        Some(data)
    }

    /// Writes the memory layer; returns keys evicted to stay within budget.
    pub fn insert_hot(
        &self,
        key: &CacheKey,
        data: Arc<Value>,
        stored_at: Timestamp,
        ttl: Duration,
        bytes: usize,
    ) -> Vec<CacheKey> {
        let evicted = self.hot.lock().insert(
            key.clone(),
            HotEntry {
                data,
                stored_at,
                ttl_ms: ttl.as_millis() as u64,
                bytes,
                last_used_tick: 0,
            },
        );
        if !evicted.is_empty() {
            debug!(%key, evicted = evicted.len(), "memory layer evicted entries");
        }
        evicted
    }

    /// Writes the persistent layer, overwriting any previous entry.
    pub async fn persist(
        &self,
        key: &CacheKey,
        data: &Value,
        stored_at: Timestamp,
        ttl: Duration,
        bytes: usize,
    ) {
        let entry = StoredEntry {
            payload: data.clone(),
            stored_at,
            ttl_ms: ttl.as_millis() as u64,
            bytes,
        };
        if let Err(e) = self.store.set(&key.storage_key(), entry).await {
            warn!(%key, error = %e, "cache store write failed");
        }
    }

    pub async fn insert(&self, key: &CacheKey, data: Arc<Value>, ttl: Duration, bytes: usize) {
        let now = self.clock.now();
        self.insert_hot(key, data.clone(), now, ttl, bytes);
        self.persist(key, &data, now, ttl, bytes).await;
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        self.hot.lock().remove(key);
        if let Err(e) = self.store.remove(&key.storage_key()).await {
            warn!(%key, error = %e, "cache store remove failed");
        }
    }

    pub async fn clear(&self) {
        {
            let mut hot = self.hot.lock();
            hot.entries.clear();
            hot.used_bytes = 0;
        }
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "cache store clear failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use foundation::time::{ManualClock, Timestamp};
    use serde_json::json;

    use super::{MemoryBudget, TtlCache};
    use crate::request::{CacheKey, SpatialKey};
    use crate::store::{CacheStore, MemoryStore};

    fn key(code: &str) -> CacheKey {
        CacheKey::new("buildings", SpatialKey::postal_code(code))
    }

    fn cache(max_bytes: usize) -> (TtlCache, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Timestamp(1_000_000)));
        let cache = TtlCache::new(MemoryBudget::new(max_bytes), store.clone(), clock.clone());
        (cache, store, clock)
    }

    #[tokio::test]
    async fn lru_eviction_is_deterministic_and_keeps_persistent_copy() {
        let (cache, store, _) = cache(10);
        let a = key("00100");
        let b = key("00120");

        cache.insert(&a, Arc::new(json!("a")), Duration::from_secs(60), 6).await;
        cache.insert(&b, Arc::new(json!("b")), Duration::from_secs(60), 6).await;

        // 12 > 10: the older entry leaves memory only.
        assert!(!cache.contains_hot(&a));
        assert!(cache.contains_hot(&b));
        assert!(cache.used_bytes() <= 10);
        assert_eq!(store.len(), 2);

        // Promoted back from the persistent layer.
        assert_eq!(cache.get(&a).await.as_deref(), Some(&json!("a")));
        assert!(cache.contains_hot(&a));
    }

    #[tokio::test]
    async fn touching_an_entry_protects_it_from_eviction() {
        let (cache, _, _) = cache(12);
        let a = key("00100");
        let b = key("00120");
        let c = key("00130");
        for k in [&a, &b] {
            cache.insert_hot(k, Arc::new(json!(1)), Timestamp(1_000_000), Duration::from_secs(60), 5);
        }
        assert!(cache.get_hot(&a).is_some());
        cache.insert_hot(&c, Arc::new(json!(1)), Timestamp(1_000_000), Duration::from_secs(60), 5);

        assert!(cache.contains_hot(&a));
        assert!(!cache.contains_hot(&b));
    }

    #[tokio::test]
    async fn expired_entries_are_misses_in_both_layers() {
        let (cache, store, clock) = cache(1_000);
        let a = key("00100");
        cache.insert(&a, Arc::new(json!({"v": 1})), Duration::from_secs(10), 8).await;

        clock.advance(Duration::from_secs(10));
        assert!(cache.get(&a).await.is_some());

        clock.advance(Duration::from_millis(1));
        assert!(cache.get(&a).await.is_none());
        assert!(!cache.contains_hot(&a));
        assert!(store.get(&a.storage_key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_entries_skip_memory_but_persist() {
        let (cache, store, _) = cache(4);
        let a = key("00100");
        cache.insert(&a, Arc::new(json!("big")), Duration::from_secs(60), 100).await;
        assert_eq!(cache.hot_len(), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_and_clear_drop_everything() {
        let (cache, store, _) = cache(1_000);
        let a = key("00100");
        let b = key("00120");
        cache.insert(&a, Arc::new(json!(1)), Duration::from_secs(60), 1).await;
        cache.insert(&b, Arc::new(json!(2)), Duration::from_secs(60), 1).await;

        cache.invalidate(&a).await;
        assert!(cache.get(&a).await.is_none());
        assert!(cache.get(&b).await.is_some());

        cache.clear().await;
        assert!(cache.get(&b).await.is_none());
        assert!(store.is_empty());
        assert_eq!(cache.used_bytes(), 0);
    }
}
