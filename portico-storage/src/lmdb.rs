//! LMDB-backed key/value store.
//!
//! Uses the heed crate (Rust bindings for LMDB). Keys are stored as their
//! UTF-8 bytes in a single unnamed database, so a namespace prefix like
//! `app_cache:` maps onto a contiguous key range.
//!
//! A full memory map (`MDB_MAP_FULL`) is reported as
//! [`PersistenceError::QuotaExceeded`]; everything else as `Unavailable`.

use std::path::Path;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, MdbError};
use portico_core::PersistenceError;

use super::kv::KeyValueStore;

/// Error type for opening an LMDB store.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// LMDB store.
///
/// # Example
///
/// ```ignore
/// let store = LmdbStore::open("/var/lib/app/cache", 64)?;
/// let cache = OfflineCache::new(Arc::new(store), "app_cache", Duration::from_secs(1800));
/// ```
pub struct LmdbStore {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbStore {
    /// Open (or create) a store under `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the memory map in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        Ok(Self { env, db })
    }
}

fn map_heed_error(err: heed::Error, key: &str) -> PersistenceError {
    match err {
        heed::Error::Mdb(MdbError::MapFull) => PersistenceError::QuotaExceeded {
            key: key.to_string(),
        },
        other => PersistenceError::Unavailable {
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl KeyValueStore for LmdbStore {
    fn name(&self) -> &'static str {
        "lmdb"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let rtxn = self.env.read_txn().map_err(|e| map_heed_error(e, key))?;
        let value = self
            .db
            .get(&rtxn, key.as_bytes())
            .map_err(|e| map_heed_error(e, key))?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        let mut wtxn = self.env.write_txn().map_err(|e| map_heed_error(e, key))?;
        self.db
            .put(&mut wtxn, key.as_bytes(), value)
            .map_err(|e| map_heed_error(e, key))?;
        wtxn.commit().map_err(|e| map_heed_error(e, key))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        let mut wtxn = self.env.write_txn().map_err(|e| map_heed_error(e, key))?;
        self.db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(|e| map_heed_error(e, key))?;
        wtxn.commit().map_err(|e| map_heed_error(e, key))?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        let rtxn = self.env.read_txn().map_err(|e| map_heed_error(e, prefix))?;
        let iter = self
            .db
            .prefix_iter(&rtxn, prefix.as_bytes())
            .map_err(|e| map_heed_error(e, prefix))?;

        let mut keys = Vec::new();
        for result in iter {
            let (key, _) = result.map_err(|e| map_heed_error(e, prefix))?;
            // Non-UTF-8 keys were not written through this trait; skip them.
            if let Ok(key) = std::str::from_utf8(key) {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }
}
