//! Feature flag resolution.
//!
//! A flag resolves as override, then default, then the caller's fallback,
//! then `false`. Defaults come from code or configuration; overrides are set at
//! runtime and persisted under [`FLAGS_STORAGE_KEY`] as a JSON map of name to
//! value.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use portico_core::ValidationError;
use portico_storage::KeyValueStore;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Store key holding the persisted override table.
pub const FLAGS_STORAGE_KEY: &str = "feature-flags";

/// Validated flag name: non-empty, no whitespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlagName(String);

impl FlagName {
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::missing("flag"));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(ValidationError::invalid("flag", "must not contain whitespace"));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FlagName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Default)]
struct FlagTable {
    defaults: BTreeMap<String, bool>,
    overrides: BTreeMap<String, bool>,
}

/// Layered flag table with persisted overrides.
///
/// Reads never touch the store. Overrides written before
/// [`load_flag_overrides`](Self::load_flag_overrides) are visible at once; the
/// load replaces them with whatever was persisted.
pub struct FeatureFlags {
    store: Arc<dyn KeyValueStore>,
    table: RwLock<FlagTable>,
    /// Held across snapshot and write so persisted state never goes backwards.
    persist: Mutex<()>,
}

impl FeatureFlags {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            table: RwLock::new(FlagTable::default()),
            persist: Mutex::new(()),
        }
    }

    /// Merge `flags` into the defaults; later definitions of a name win.
    pub fn define_flags<I, K>(&self, flags: I)
    where
        I: IntoIterator<Item = (K, bool)>,
        K: Into<String>,
    {
        let mut table = self.write_table();
        for (name, value) in flags {
            table.defaults.insert(name.into(), value);
        }
    }

    pub fn get_flag(&self, name: &str, fallback: Option<bool>) -> bool {
        let table = self.read_table();
        table
            .overrides
            .get(name)
            .or_else(|| table.defaults.get(name))
            .copied()
            .or(fallback)
            .unwrap_or(false)
    }

    /// `get_flag(name, None)`.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.get_flag(name, None)
    }

    /// Set an override and persist the whole override table before returning.
    ///
    /// An invalid name is rejected before anything changes. A failed write is
    /// logged and otherwise ignored; the in-memory override still applies.
    pub async fn set_flag_override(&self, name: &str, value: bool) -> Result<(), ValidationError> {
        let name = FlagName::new(name)?;
        let _persist = self.persist.lock().await;
        let snapshot = {
            let mut table = self.write_table();
            table.overrides.insert(name.0, value);
            table.overrides.clone()
        };
        self.persist_overrides(&snapshot).await;
        Ok(())
    }

    /// Drop every override and the persisted record.
    pub async fn clear_flag_overrides(&self) {
        let _persist = self.persist.lock().await;
        self.write_table().overrides.clear();
        if let Err(err) = self.store.remove(FLAGS_STORAGE_KEY).await {
            warn!(error = %err, "failed to remove persisted flag overrides");
        }
    }

    /// Replace the in-memory overrides with the persisted ones.
    ///
    /// Returns how many overrides were loaded. Missing, unreadable and corrupt
    /// records all load nothing.
    pub async fn load_flag_overrides(&self) -> usize {
        let _persist = self.persist.lock().await;
        let loaded: BTreeMap<String, bool> = match self.store.get(FLAGS_STORAGE_KEY).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(err) => {
                    warn!(error = %err, "ignoring corrupt flag overrides");
                    BTreeMap::new()
                }
            },
            Ok(None) => BTreeMap::new(),
            Err(err) => {
                debug!(error = %err, "flag overrides unavailable");
                BTreeMap::new()
            }
        };
        let count = loaded.len();
        self.write_table().overrides = loaded;
        count
    }

    pub fn overrides(&self) -> BTreeMap<String, bool> {
        self.read_table().overrides.clone()
    }

    pub fn defaults(&self) -> BTreeMap<String, bool> {
        self.read_table().defaults.clone()
    }

    async fn persist_overrides(&self, overrides: &BTreeMap<String, bool>) {
        let bytes = match serde_json::to_vec(overrides) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "flag overrides not serializable");
                return;
            }
        };
        if let Err(err) = self.store.set(FLAGS_STORAGE_KEY, &bytes).await {
            warn!(error = %err, "failed to persist flag overrides");
        }
    }

    fn read_table(&self) -> std::sync::RwLockReadGuard<'_, FlagTable> {
        self.table.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_table(&self) -> std::sync::RwLockWriteGuard<'_, FlagTable> {
        self.table.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for FeatureFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.read_table();
        f.debug_struct("FeatureFlags")
            .field("store", &self.store.name())
            .field("defaults", &table.defaults)
            .field("overrides", &table.overrides)
            .finish()
    }
}
