// ── Durable key-value cache ──
//
// In-memory map with an optional persistent mirror. Entries carry a
// write timestamp and an expiry; expired entries are treated as misses
// and evicted lazily — there is no background sweep. Mutations notify
// per-key subscribers synchronously so multiple query coordinators
// observing the same key converge without duplicating fetches.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::persist::{self, StorageBackend};

/// Prefix for all cache keys in the persistent mirror.
const PERSIST_PREFIX: &str = "dashsync:cache:";

// ── Entry types ─────────────────────────────────────────────────────

/// A typed view of one cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub written_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Internal type-erased entry; values are stored as JSON so the cache
/// can hold heterogeneous types behind opaque string keys.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoredEntry {
    data: Value,
    timestamp: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

// ── CacheService ────────────────────────────────────────────────────

/// Explicit, constructible cache object with an injected persistence
/// backend. Owned by the application's composition root and shared by
/// handle — no module-level globals, fresh instances per test.
pub struct CacheService {
    memory: DashMap<String, StoredEntry>,
    mirror: Option<Arc<dyn StorageBackend>>,
    channels: DashMap<String, watch::Sender<u64>>,
}

impl CacheService {
    /// Memory-only cache (no persistent mirror).
    pub fn new() -> Self {
        Self {
            memory: DashMap::new(),
            mirror: None,
            channels: DashMap::new(),
        }
    }

    /// Cache with a persistent mirror. Mirror writes are best-effort;
    /// mirror reads serve as a fallback on memory misses.
    pub fn with_mirror(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            memory: DashMap::new(),
            mirror: Some(backend),
            channels: DashMap::new(),
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Look up a key. Checks memory first; on a miss, falls back to the
    /// mirror and repopulates memory on a hit there. Expired entries
    /// are evicted and reported as misses. Corrupt persisted records
    /// are treated as misses.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        if let Some(entry) = self.memory.get(key).map(|r| r.value().clone()) {
            if entry.expires_at <= Utc::now() {
                drop(self.memory.remove(key));
                self.mirror_remove(key);
                self.notify(key);
                return None;
            }
            return self.typed(key, &entry);
        }

        // Memory miss — try the mirror.
        let entry = self.mirror_read(key)?;
        if entry.expires_at <= Utc::now() {
            self.mirror_remove(key);
            return None;
        }

        self.memory.insert(key.to_owned(), entry.clone());
        self.typed(key, &entry)
    }

    /// Whether a live (unexpired) entry exists without deserializing it.
    pub fn contains(&self, key: &str) -> bool {
        self.memory
            .get(key)
            .is_some_and(|r| r.expires_at > Utc::now())
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Write a value with the given time-to-live. Memory always wins;
    /// the mirror write is best-effort and failures are swallowed with
    /// a warning (the cache degrades to memory-only).
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let data = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(key, error = %e, "cache value not serializable, dropping write");
                return;
            }
        };

        let now = Utc::now();
        let entry = StoredEntry {
            data,
            timestamp: now,
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
        };

        self.mirror_write(key, &entry);
        self.memory.insert(key.to_owned(), entry);
        self.notify(key);
    }

    /// Remove a single key from memory and mirror.
    pub fn invalidate(&self, key: &str) {
        self.memory.remove(key);
        self.mirror_remove(key);
        self.notify(key);
    }

    /// Remove every key starting with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let keys: Vec<String> = self
            .memory
            .iter()
            .map(|r| r.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        for key in &keys {
            self.invalidate(key);
        }

        // The mirror may hold keys evicted from memory.
        if let Some(ref mirror) = self.mirror {
            let persisted_prefix = format!("{PERSIST_PREFIX}{prefix}");
            if let Ok(mirror_keys) = mirror.keys() {
                for persisted in mirror_keys {
                    if let Some(key) = persisted.strip_prefix(PERSIST_PREFIX) {
                        if persisted.starts_with(&persisted_prefix) && !keys.iter().any(|k| k == key)
                        {
                            self.invalidate(key);
                        }
                    }
                }
            }
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        let keys: Vec<String> = self.memory.iter().map(|r| r.key().clone()).collect();
        for key in keys {
            self.invalidate(&key);
        }

        if let Some(ref mirror) = self.mirror {
            if let Ok(mirror_keys) = mirror.keys() {
                for persisted in mirror_keys {
                    if let Some(key) = persisted.strip_prefix(PERSIST_PREFIX) {
                        self.invalidate(key);
                    }
                }
            }
        }
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Subscribe to mutations of one key. The receiver's value is a
    /// version counter bumped synchronously after every write, removal,
    /// or expiry eviction of that key.
    pub fn subscribe(&self, key: &str) -> watch::Receiver<u64> {
        self.channels
            .entry(key.to_owned())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    fn notify(&self, key: &str) {
        if let Some(sender) = self.channels.get(key) {
            sender.send_modify(|v| *v += 1);
        }
    }

    // ── Mirror plumbing ──────────────────────────────────────────────

    fn persist_key(key: &str) -> String {
        format!("{PERSIST_PREFIX}{key}")
    }

    fn mirror_read(&self, key: &str) -> Option<StoredEntry> {
        let mirror = self.mirror.as_ref()?;
        let raw = match mirror.read(&Self::persist_key(key)) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key, error = %e, "cache mirror read failed");
                return None;
            }
        };

        match persist::decode::<StoredEntry>(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                // Corrupt or stale-schema record: treat as a miss and
                // clean it up so the next write starts fresh.
                warn!(key, error = %e, "discarding unreadable cache record");
                self.mirror_remove(key);
                None
            }
        }
    }

    fn mirror_write(&self, key: &str, entry: &StoredEntry) {
        let Some(ref mirror) = self.mirror else {
            return;
        };
        match persist::encode(entry) {
            Ok(raw) => {
                if let Err(e) = mirror.write(&Self::persist_key(key), &raw) {
                    warn!(key, error = %e, "cache mirror write failed, continuing memory-only");
                }
            }
            Err(e) => warn!(key, error = %e, "cache mirror encode failed"),
        }
    }

    fn mirror_remove(&self, key: &str) {
        if let Some(ref mirror) = self.mirror {
            if let Err(e) = mirror.remove(&Self::persist_key(key)) {
                warn!(key, error = %e, "cache mirror remove failed");
            }
        }
    }

    fn typed<T: DeserializeOwned>(&self, key: &str, entry: &StoredEntry) -> Option<CacheEntry<T>> {
        match serde_json::from_value(entry.data.clone()) {
            Ok(value) => Some(CacheEntry {
                value,
                written_at: entry.timestamp,
                expires_at: entry.expires_at,
            }),
            Err(e) => {
                debug!(key, error = %e, "cached value does not match requested type");
                None
            }
        }
    }
}

impl Default for CacheService {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::persist::{MemoryBackend, PersistError};

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Revenue {
        total: u64,
    }

    #[test]
    fn get_after_set_returns_fresh_value() {
        let cache = CacheService::new();
        cache.set("orders", &Revenue { total: 42 }, Duration::from_secs(60));

        let entry = cache.get::<Revenue>("orders").unwrap();
        assert_eq!(entry.value, Revenue { total: 42 });
        assert!(entry.expires_at > Utc::now());
    }

    #[test]
    fn expired_entry_is_a_miss_and_evicted() {
        let cache = CacheService::new();
        cache.set("orders", &Revenue { total: 42 }, Duration::ZERO);

        assert!(cache.get::<Revenue>("orders").is_none());
        // Evicted, not just hidden.
        assert!(!cache.contains("orders"));
    }

    #[test]
    fn mirror_fallback_repopulates_memory() {
        let backend = Arc::new(MemoryBackend::new());
        let writer = CacheService::with_mirror(backend.clone());
        writer.set("orders", &Revenue { total: 7 }, Duration::from_secs(60));

        // Fresh cache instance sharing the same backend: memory miss,
        // mirror hit.
        let reader = CacheService::with_mirror(backend);
        let entry = reader.get::<Revenue>("orders").unwrap();
        assert_eq!(entry.value.total, 7);
        assert!(reader.contains("orders"));
    }

    #[test]
    fn corrupt_mirror_record_is_a_miss() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .write("dashsync:cache:orders", "{ definitely not valid")
            .unwrap();

        let cache = CacheService::with_mirror(backend.clone());
        assert!(cache.get::<Revenue>("orders").is_none());
        // Unreadable record cleaned up.
        assert!(backend.read("dashsync:cache:orders").unwrap().is_none());
    }

    #[test]
    fn invalidate_prefix_removes_matching_keys_only() {
        let cache = CacheService::new();
        cache.set("orders:page:1", &1u32, Duration::from_secs(60));
        cache.set("orders:page:2", &2u32, Duration::from_secs(60));
        cache.set("revenue", &3u32, Duration::from_secs(60));

        cache.invalidate_prefix("orders:");

        assert!(cache.get::<u32>("orders:page:1").is_none());
        assert!(cache.get::<u32>("orders:page:2").is_none());
        assert_eq!(cache.get::<u32>("revenue").unwrap().value, 3);
    }

    #[test]
    fn subscribers_see_one_version_bump_per_write() {
        let cache = CacheService::new();
        let rx = cache.subscribe("orders");
        assert_eq!(*rx.borrow(), 0);

        cache.set("orders", &1u32, Duration::from_secs(60));
        assert_eq!(*rx.borrow(), 1);

        cache.invalidate("orders");
        assert_eq!(*rx.borrow(), 2);
    }

    /// Backend that fails every write, to prove degradation is silent.
    struct QuotaExceeded;

    impl StorageBackend for QuotaExceeded {
        fn read(&self, _: &str) -> Result<Option<String>, PersistError> {
            Ok(None)
        }
        fn write(&self, key: &str, _: &str) -> Result<(), PersistError> {
            Err(PersistError::Io {
                key: key.to_owned(),
                source: std::io::Error::other("quota exceeded"),
            })
        }
        fn remove(&self, _: &str) -> Result<(), PersistError> {
            Ok(())
        }
        fn keys(&self) -> Result<Vec<String>, PersistError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn mirror_failure_degrades_to_memory_only() {
        let cache = CacheService::with_mirror(Arc::new(QuotaExceeded));
        cache.set("orders", &Revenue { total: 9 }, Duration::from_secs(60));

        // The write still landed in memory.
        assert_eq!(cache.get::<Revenue>("orders").unwrap().value.total, 9);
    }
}
