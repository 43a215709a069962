// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resource response cache with LRU eviction and TTL.
//!
//! Entries are keyed by `(server, uri)`, so writes from different servers never
//! collide. The cache is only an optimization: every read path works the same
//! with it disabled.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default max number of entries.
pub const DEFAULT_MAX_ENTRIES: usize = 1024;

/// Default max total payload size (16 MiB).
pub const DEFAULT_MAX_BYTES: usize = 16 * 1024 * 1024;

/// Cache key: the server plus the resource URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub server: String,
    pub uri: String,
}

impl CacheKey {
    pub fn new(server: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            uri: uri.into(),
        }
    }
}

/// Cache entry with timestamps.
struct CacheEntry {
    payload: Value,
    size: usize,
    inserted_at: Instant,
    ttl: Duration,
    /// `None` when the TTL runs past the clock's range.
    deadline: Option<Instant>,
    /// Insertion tick, unique per entry.
    seq: u64,
    last_accessed: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

/// Global budget for the shared cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheBudget {
    /// Maximum number of entries across all servers.
    pub max_entries: usize,

    /// Maximum total serialized payload size in bytes.
    pub max_bytes: usize,
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// Entries plus the orderings eviction needs. Every index is keyed by a
/// unique tick, so lookups of the oldest entry or the next deadline are
/// `O(log n)`.
#[derive(Default)]
struct CacheTable {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Access tick -> key, least recent first.
    recency: BTreeMap<u64, CacheKey>,
    /// Per-server access order. Its length is the server's entry count.
    by_server: HashMap<String, BTreeMap<u64, CacheKey>>,
    /// (deadline, seq) -> key, soonest first.
    deadlines: BTreeMap<(Instant, u64), CacheKey>,
    total_bytes: usize,
    server_limits: HashMap<String, usize>,
}

impl CacheTable {
    fn insert(&mut self, key: CacheKey, entry: CacheEntry) {
        self.remove(&key);
        self.total_bytes += entry.size;
        self.recency.insert(entry.last_accessed, key.clone());
        self.by_server
            .entry(key.server.clone())
            .or_default()
            .insert(entry.last_accessed, key.clone());
        if let Some(deadline) = entry.deadline {
            self.deadlines.insert((deadline, entry.seq), key.clone());
        }
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes -= entry.size;
        self.recency.remove(&entry.last_accessed);
        if let Some(order) = self.by_server.get_mut(&key.server) {
            order.remove(&entry.last_accessed);
            if order.is_empty() {
                self.by_server.remove(&key.server);
            }
        }
        if let Some(deadline) = entry.deadline {
            self.deadlines.remove(&(deadline, entry.seq));
        }
        Some(entry)
    }

    /// Move an entry to the most-recent end.
    fn touch(&mut self, key: &CacheKey, tick: u64) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let previous = std::mem::replace(&mut entry.last_accessed, tick);

        self.recency.remove(&previous);
        self.recency.insert(tick, key.clone());
        if let Some(order) = self.by_server.get_mut(&key.server) {
            order.remove(&previous);
            order.insert(tick, key.clone());
        }
    }

    fn least_recent(&self, server: Option<&str>) -> Option<CacheKey> {
        let order = match server {
            Some(server) => self.by_server.get(server)?,
            None => &self.recency,
        };
        order.values().next().cloned()
    }

    fn count_for(&self, server: &str) -> usize {
        self.by_server.get(server).map_or(0, BTreeMap::len)
    }

    /// Drop every entry whose deadline has passed.
    fn remove_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<CacheKey> = self
            .deadlines
            .range(..=(now, u64::MAX))
            .map(|(_, key)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
        self.by_server.clear();
        self.deadlines.clear();
        self.total_bytes = 0;
    }
}

/// Thread-safe resource cache shared by all sessions.
pub struct ResponseCache {
    table: RwLock<CacheTable>,
    budget: CacheBudget,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    /// Create a cache with the default budget.
    pub fn new() -> Self {
        Self::with_budget(CacheBudget::default())
    }

    /// Create a cache with a custom budget.
    pub fn with_budget(budget: CacheBudget) -> Self {
        Self {
            table: RwLock::new(CacheTable::default()),
            budget,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Cap the number of entries a single server may hold.
    pub fn set_server_limit(&self, server: &str, max_entries: usize) {
        self.write()
            .server_limits
            .insert(server.to_string(), max_entries);
    }

    /// Get a live payload, or `None` on a miss.
    ///
    /// Expired entries are removed on the spot.
    pub fn get(&self, server: &str, uri: &str) -> Option<Value> {
        let key = CacheKey::new(server, uri);
        let now = Instant::now();
        let mut table = self.write();

        let lookup = table
            .entries
            .get(&key)
            .map(|entry| (!entry.is_expired(now)).then(|| entry.payload.clone()));

        let live = match lookup {
            Some(Some(payload)) => Some(payload),
            Some(None) => {
                table.remove(&key);
                trace!(server, uri, "Cache entry expired");
                None
            }
            None => None,
        };

        match live {
            Some(payload) => {
                table.touch(&key, self.tick());
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(server, uri, "Cache hit");
                Some(payload)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or overwrite an entry, then evict least-recently-used entries
    /// until the cache is back under budget.
    pub fn put(&self, server: &str, uri: &str, payload: Value, ttl: Duration) {
        let size = serde_json::to_vec(&payload).map(|b| b.len()).unwrap_or(0);
        if size > self.budget.max_bytes || self.budget.max_entries == 0 || ttl.is_zero() {
            debug!(server, uri, size, "Not caching payload");
            return;
        }

        let mut table = self.write();
        let now = Instant::now();
        let tick = self.tick();
        let entry = CacheEntry {
            payload,
            size,
            inserted_at: now,
            ttl,
            deadline: now.checked_add(ttl),
            seq: tick,
            last_accessed: tick,
        };
        table.insert(CacheKey::new(server, uri), entry);

        self.evict(&mut table, server);
    }

    fn evict(&self, table: &mut CacheTable, server: &str) {
        // Expired entries go first.
        table.remove_expired(Instant::now());

        if let Some(limit) = table.server_limits.get(server).copied() {
            while table.count_for(server) > limit {
                let Some(key) = table.least_recent(Some(server)) else { break };
                table.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(server = %key.server, uri = %key.uri, "Evicted (server limit)");
            }
        }

        while table.entries.len() > self.budget.max_entries
            || table.total_bytes > self.budget.max_bytes
        {
            let Some(key) = table.least_recent(None) else { break };
            table.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(server = %key.server, uri = %key.uri, "Evicted (budget)");
        }
    }

    /// Drop one entry. Returns whether it was present.
    pub fn invalidate(&self, server: &str, uri: &str) -> bool {
        self.write().remove(&CacheKey::new(server, uri)).is_some()
    }

    /// Drop every entry belonging to a server.
    pub fn invalidate_server(&self, server: &str) -> usize {
        let mut table = self.write();
        let keys: Vec<CacheKey> = table
            .by_server
            .get(server)
            .map(|order| order.values().cloned().collect())
            .unwrap_or_default();
        for key in &keys {
            table.remove(key);
        }
        keys.len()
    }

    /// Remove expired entries.
    pub fn prune(&self) -> usize {
        self.write().remove_expired(Instant::now())
    }

    /// Clear all cached payloads.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Whether a live entry exists, without touching recency or counters.
    pub fn contains(&self, server: &str, uri: &str) -> bool {
        let now = Instant::now();
        self.read()
            .entries
            .get(&CacheKey::new(server, uri))
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = {
            let table = self.read();
            (table.entries.len(), table.total_bytes)
        };

        CacheStats {
            entries,
            bytes,
            max_entries: self.budget.max_entries,
            max_bytes: self.budget.max_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub max_entries: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_put_get() {
        let cache = ResponseCache::new();
        cache.put("alpha", "file:///a", json!({"text": "a"}), HOUR);

        assert_eq!(cache.get("alpha", "file:///a"), Some(json!({"text": "a"})));
        assert_eq!(cache.get("beta", "file:///a"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_served_past_ttl() {
        let cache = ResponseCache::new();
        cache.put("alpha", "file:///a", json!("v1"), Duration::from_millis(50));

        tokio::time::advance(Duration::from_millis(49)).await;
        assert!(cache.get("alpha", "file:///a").is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get("alpha", "file:///a").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_invalidate_empties_slot() {
        let cache = ResponseCache::new();
        cache.put("alpha", "file:///a", json!(1), HOUR);
        cache.put("beta", "file:///a", json!(2), HOUR);

        assert!(cache.invalidate("alpha", "file:///a"));
        assert!(!cache.invalidate("alpha", "file:///a"));
        assert!(cache.get("alpha", "file:///a").is_none());
        assert_eq!(cache.get("beta", "file:///a"), Some(json!(2)));
    }

    #[test]
    fn test_lru_eviction_by_count() {
        let cache = ResponseCache::with_budget(CacheBudget {
            max_entries: 2,
            max_bytes: DEFAULT_MAX_BYTES,
        });
        cache.put("alpha", "a", json!(1), HOUR);
        cache.put("alpha", "b", json!(2), HOUR);

        // Touch "a" so "b" becomes least recently used.
        assert!(cache.get("alpha", "a").is_some());
        cache.put("alpha", "c", json!(3), HOUR);

        assert!(cache.contains("alpha", "a"));
        assert!(!cache.contains("alpha", "b"));
        assert!(cache.contains("alpha", "c"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_eviction_by_bytes() {
        let cache = ResponseCache::with_budget(CacheBudget {
            max_entries: 100,
            max_bytes: 20,
        });
        cache.put("alpha", "a", json!("0123456789"), HOUR); // 12 bytes
        cache.put("alpha", "b", json!("0123456789"), HOUR);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert!(stats.bytes <= 20);
        assert!(cache.contains("alpha", "b"));

        // Larger than the whole budget: never stored.
        cache.put("alpha", "huge", json!("x".repeat(64)), HOUR);
        assert!(!cache.contains("alpha", "huge"));
    }

    #[test]
    fn test_server_limit() {
        let cache = ResponseCache::new();
        cache.set_server_limit("alpha", 1);
        cache.put("alpha", "a", json!(1), HOUR);
        cache.put("alpha", "b", json!(2), HOUR);
        cache.put("beta", "a", json!(3), HOUR);
        cache.put("beta", "b", json!(4), HOUR);

        assert!(!cache.contains("alpha", "a"));
        assert!(cache.contains("alpha", "b"));
        assert!(cache.contains("beta", "a"));
        assert!(cache.contains("beta", "b"));
    }

    #[test]
    fn test_overwrite_keeps_byte_count() {
        let cache = ResponseCache::new();
        cache.put("alpha", "a", json!("first"), HOUR);
        cache.put("alpha", "a", json!("second!"), HOUR);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, serde_json::to_vec(&json!("second!")).unwrap().len());
    }

    #[test]
    fn test_invalidate_server_and_clear() {
        let cache = ResponseCache::new();
        cache.put("alpha", "a", json!(1), HOUR);
        cache.put("alpha", "b", json!(2), HOUR);
        cache.put("beta", "a", json!(3), HOUR);

        assert_eq!(cache.invalidate_server("alpha"), 2);
        assert_eq!(cache.stats().entries, 1);

        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune() {
        let cache = ResponseCache::new();
        cache.put("alpha", "short", json!(1), Duration::from_millis(10));
        cache.put("alpha", "long", json!(2), HOUR);

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(cache.prune(), 1);
        assert!(cache.contains("alpha", "long"));
    }

    #[test]
    fn test_eviction_order_survives_many_inserts() {
        let cache = ResponseCache::with_budget(CacheBudget {
            max_entries: 100,
            max_bytes: DEFAULT_MAX_BYTES,
        });
        cache.set_server_limit("alpha", 10);

        for i in 0..1000 {
            cache.put("alpha", &format!("a{}", i), json!(i), HOUR);
            cache.put("beta", &format!("b{}", i), json!(i), HOUR);
            // Keep one beta entry hot.
            assert!(cache.get("beta", "b0").is_some());
        }

        assert_eq!(cache.stats().entries, 100);
        assert!(cache.contains("alpha", "a999"));
        assert!(cache.contains("alpha", "a990"));
        assert!(!cache.contains("alpha", "a989"));
        assert!(cache.contains("beta", "b0"));
        assert!(cache.contains("beta", "b999"));
        assert_eq!(cache.invalidate_server("alpha"), 10);
        assert_eq!(cache.stats().entries, 90);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_evicted_before_live_ones() {
        let cache = ResponseCache::with_budget(CacheBudget {
            max_entries: 2,
            max_bytes: DEFAULT_MAX_BYTES,
        });
        cache.put("alpha", "live", json!(1), HOUR);
        cache.put("alpha", "stale", json!(2), Duration::from_millis(10));

        tokio::time::advance(Duration::from_millis(20)).await;
        cache.put("alpha", "new", json!(3), HOUR);

        assert!(cache.contains("alpha", "live"));
        assert!(cache.contains("alpha", "new"));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_poisoned_lock_recovers() {
        let cache = std::sync::Arc::new(ResponseCache::new());
        cache.put("alpha", "a", json!(1), HOUR);

        let poisoner = std::sync::Arc::clone(&cache);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.table.write().unwrap();
            panic!("poison the cache lock");
        })
        .join();

        assert!(cache.table.is_poisoned());
        assert_eq!(cache.get("alpha", "a"), Some(json!(1)));
        cache.put("alpha", "b", json!(2), HOUR);
        assert!(cache.contains("alpha", "b"));
        assert!(cache.invalidate("alpha", "a"));
        assert_eq!(cache.stats().entries, 1);
    }
}
