//! Offline cache with per-entry TTL.
//!
//! Entries are persisted as `{"data": .., "timestamp": <epoch ms>, "ttl": <ms>}`
//! under `"<namespace>:" + key`. An entry is expired once
//! `now - timestamp > ttl`; the `get` that observes this deletes it.
//!
//! Every storage failure degrades silently: reads turn into misses and writes
//! are dropped. Nothing in this module returns an error to its caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::kv::KeyValueStore;

/// Persisted cache record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    /// Write time, epoch milliseconds.
    pub timestamp: i64,
    /// Lifetime, milliseconds.
    pub ttl: u64,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, ttl: Duration) -> Self {
        Self {
            data,
            timestamp: now_ms(),
            ttl: ttl.as_millis().min(u64::MAX as u128) as u64,
        }
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        let age = now_ms.saturating_sub(self.timestamp);
        age > 0 && age as u64 > self.ttl
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    /// Time since the entry was written.
    pub fn age(&self) -> Duration {
        let age = now_ms().saturating_sub(self.timestamp).max(0);
        Duration::from_millis(age as u64)
    }
}

/// Counters describing cache behaviour since construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries deleted because a read found them past their TTL.
    pub expired: u64,
    /// Writes dropped because the store refused them.
    pub dropped_writes: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    dropped_writes: AtomicU64,
}

/// TTL cache over a [`KeyValueStore`].
#[derive(Clone)]
pub struct OfflineCache {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    default_ttl: Duration,
    counters: Arc<Counters>,
}

impl OfflineCache {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        namespace: impl Into<String>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            default_ttl,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The key actually written to the store for `key`.
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// Return the cached value, or `None` on miss, expiry or storage failure.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_entry(key).await.map(|entry| entry.data)
    }

    /// Like [`get`](Self::get), keeping the timestamp and TTL.
    pub async fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        let storage_key = self.storage_key(key);
        let bytes = match self.store.get(&storage_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(err) => {
                debug!(key = %storage_key, store = self.store.name(), error = %err, "cache read failed; treating as miss");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let entry: CacheEntry<T> = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key = %storage_key, error = %err, "dropping unreadable cache record");
                self.remove_quietly(&storage_key).await;
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if entry.is_expired() {
            self.remove_quietly(&storage_key).await;
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Store `data` under `key`, overwriting unconditionally.
    ///
    /// `ttl` of `None` uses the cache's default TTL.
    pub async fn set<T: Serialize>(&self, key: &str, data: &T, ttl: Option<Duration>) {
        let storage_key = self.storage_key(key);
        let entry = CacheEntry::new(data, ttl.unwrap_or(self.default_ttl));
        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key = %storage_key, error = %err, "cache value not serializable; write dropped");
                self.counters.dropped_writes.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if let Err(err) = self.store.set(&storage_key, &bytes).await {
            debug!(key = %storage_key, store = self.store.name(), error = %err, "cache write dropped");
            self.counters.dropped_writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn remove(&self, key: &str) {
        let storage_key = self.storage_key(key);
        self.remove_quietly(&storage_key).await;
    }

    /// Remove every entry under this cache's namespace and nothing else.
    pub async fn clear(&self) {
        self.remove_prefix("").await;
    }

    /// Remove every entry whose logical key starts with `prefix`.
    pub async fn remove_prefix(&self, prefix: &str) {
        let prefix = self.storage_key(prefix);
        let keys = match self.store.keys_with_prefix(&prefix).await {
            Ok(keys) => keys,
            Err(err) => {
                debug!(prefix = %prefix, error = %err, "cache prefix removal skipped");
                return;
            }
        };
        for key in keys {
            self.remove_quietly(&key).await;
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            dropped_writes: self.counters.dropped_writes.load(Ordering::Relaxed),
        }
    }

    async fn remove_quietly(&self, storage_key: &str) {
        if let Err(err) = self.store.remove(storage_key).await {
            debug!(key = %storage_key, error = %err, "cache remove failed");
        }
    }
}

impl std::fmt::Debug for OfflineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineCache")
            .field("store", &self.store.name())
            .field("namespace", &self.namespace)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn cache_with_store() -> (OfflineCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let cache = OfflineCache::new(store.clone(), "app_cache", Duration::from_secs(1800));
        (cache, store)
    }

    #[tokio::test]
    async fn test_set_then_get_returns_value() {
        let (cache, store) = cache_with_store();
        cache.set("todos", &json!([{"id": "1"}]), None).await;
        let value: Option<serde_json::Value> = cache.get("todos").await;
        assert_eq!(value, Some(json!([{"id": "1"}])));
        assert!(store.contains("app_cache:todos"));
    }

    #[tokio::test]
    async fn test_persisted_record_shape() {
        let (cache, store) = cache_with_store();
        cache.set("k", &42, Some(Duration::from_millis(5000))).await;
        let bytes = store.get("app_cache:k").await.unwrap().unwrap();
        let record: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record["data"], 42);
        assert_eq!(record["ttl"], 5000);
        assert!(record["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_expired_entry_is_removed_on_get() {
        let (cache, store) = cache_with_store();
        cache.set("k", &"v", Some(Duration::from_millis(20))).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        let value: Option<String> = cache.get("k").await;
        assert!(value.is_none());
        assert!(!store.contains("app_cache:k"));
        assert_eq!(cache.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_clear_only_touches_namespace() {
        let (cache, store) = cache_with_store();
        cache.set("a", &1, None).await;
        cache.set("b", &2, None).await;
        store.set("feature-flags", b"{}").await.unwrap();

        cache.clear().await;

        assert!(!store.contains("app_cache:a"));
        assert!(!store.contains("app_cache:b"));
        assert!(store.contains("feature-flags"));
    }

    #[tokio::test]
    async fn test_read_failure_is_a_miss() {
        let (cache, store) = cache_with_store();
        cache.set("k", &1, None).await;
        store.set_fail_reads(true);
        let value: Option<i32> = cache.get("k").await;
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_quota_exceeded_write_is_dropped() {
        let store = Arc::new(MemoryStore::with_quota(16));
        let cache = OfflineCache::new(store.clone(), "app_cache", Duration::from_secs(60));
        cache.set("big", &"x".repeat(100), None).await;
        let value: Option<String> = cache.get("big").await;
        assert!(value.is_none());
        assert_eq!(cache.stats().dropped_writes, 1);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_dropped() {
        let (cache, store) = cache_with_store();
        store.set("app_cache:k", b"not json").await.unwrap();
        let value: Option<i32> = cache.get("k").await;
        assert!(value.is_none());
        assert!(!store.contains("app_cache:k"));
    }

    #[tokio::test]
    async fn test_remove_prefix_spares_other_keys() {
        let (cache, store) = cache_with_store();
        cache.set("query:todos:{}", &1, None).await;
        cache.set(r#"query:todos:{"limit":5}"#, &2, None).await;
        cache.set("query:todos_archive:{}", &3, None).await;

        cache.remove_prefix("query:todos:").await;

        assert!(!store.contains("app_cache:query:todos:{}"));
        assert!(!store.contains(r#"app_cache:query:todos:{"limit":5}"#));
        assert!(store.contains("app_cache:query:todos_archive:{}"));
    }

    #[tokio::test]
    async fn test_remove() {
        let (cache, store) = cache_with_store();
        cache.set("k", &1, None).await;
        cache.remove("k").await;
        assert!(!store.contains("app_cache:k"));
    }

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);
        assert!((CacheStats::default().hit_rate() - 0.0).abs() < 0.001);
    }

    fn arb_json() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::Bool),
            any::<i64>().prop_map(serde_json::Value::from),
            "[a-zA-Z0-9 ]{0,16}".prop_map(serde_json::Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|map| serde_json::Value::Object(map.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn set_then_get_returns_what_was_stored(
            key in "[a-zA-Z0-9:_{}-]{1,24}",
            data in arb_json(),
            ttl_ms in 1_000u64..86_400_000,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (cache, _) = cache_with_store();
            let read: Option<serde_json::Value> = runtime.block_on(async {
                cache.set(&key, &data, Some(Duration::from_millis(ttl_ms))).await;
                cache.get(&key).await
            });
            prop_assert_eq!(read, Some(data));
        }

        #[test]
        fn expiry_is_strictly_after_ttl(timestamp in 0i64..1_000_000_000, ttl in 0u64..10_000_000, delta in 0i64..20_000_000) {
            let entry = CacheEntry { data: (), timestamp, ttl };
            let now = timestamp + delta;
            prop_assert_eq!(entry.is_expired_at(now), delta as u64 > ttl);
        }
    }
}
