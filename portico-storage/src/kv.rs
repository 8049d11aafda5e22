//! Key/value store trait and the in-memory implementation.

use async_trait::async_trait;
use portico_core::PersistenceError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Byte-oriented persistent store.
///
/// Keys are plain strings; namespacing is the caller's job. Implementations
/// must be usable from several tasks at once.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// A name for tracing, e.g. "memory" or "lmdb".
    fn name(&self) -> &'static str;

    /// Read the value under `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Overwrite the value under `key`.
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError>;

    /// Delete `key`. Deleting an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<(), PersistenceError>;

    /// All keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, PersistenceError>;
}

/// In-memory store.
///
/// Reads and writes can be made to fail on demand, which is how tests exercise
/// the silent-degradation paths of the cache and flag table.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    quota_bytes: Option<usize>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would push the total stored size past `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            quota_bytes: Some(bytes),
            ..Self::default()
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Synchronous peek, for assertions.
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unavailable() -> PersistenceError {
        PersistenceError::Unavailable {
            reason: "memory store switched off".to_string(),
        }
    }

    fn poisoned() -> PersistenceError {
        PersistenceError::Unavailable {
            reason: "memory store lock poisoned".to_string(),
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        if let Some(quota) = self.quota_bytes {
            let current: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if current + key.len() + value.len() > quota {
                return Err(PersistenceError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = MemoryStore::new();
        store.set("a", b"1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
        store.remove("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        store.remove("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let store = MemoryStore::new();
        store.set("app_cache:a", b"1").await.unwrap();
        store.set("app_cache:b", b"2").await.unwrap();
        store.set("app_cachez", b"3").await.unwrap();
        store.set("feature-flags", b"{}").await.unwrap();
        let keys = store.keys_with_prefix("app_cache:").await.unwrap();
        assert_eq!(keys, vec!["app_cache:a".to_string(), "app_cache:b".to_string()]);
    }

    #[tokio::test]
    async fn test_quota_rejects_large_write() {
        let store = MemoryStore::with_quota(8);
        store.set("k", b"1234").await.unwrap();
        let err = store.set("k2", b"123456").await.unwrap_err();
        assert!(matches!(err, PersistenceError::QuotaExceeded { .. }));
        // Overwriting an existing key only counts the new value.
        store.set("k", b"1234567").await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStore::new();
        store.set_fail_reads(true);
        assert!(store.get("a").await.is_err());
        store.set_fail_writes(true);
        assert!(store.set("a", b"1").await.is_err());
    }
}
