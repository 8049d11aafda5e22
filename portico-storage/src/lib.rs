//! Local persistence for portico.
//!
//! [`KeyValueStore`] is the seam between the offline cache / flag table and
//! whatever actually holds bytes on this device. Two stores ship here:
//! [`MemoryStore`] for tests and ephemeral sessions, and [`LmdbStore`] for
//! data that should survive a restart.
//!
//! [`OfflineCache`] layers per-entry TTLs on top of any store. Expiry is lazy:
//! an expired entry is deleted by the `get` that notices it.

pub mod cache;
pub mod kv;
pub mod lmdb;

pub use cache::{CacheEntry, CacheStats, OfflineCache};
pub use kv::{KeyValueStore, MemoryStore};
pub use lmdb::{LmdbStore, LmdbStoreError};
