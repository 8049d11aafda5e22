//! Stale-while-revalidate reads and plain writes.
//!
//! Each logical query key owns a slot holding the surfaced state and a
//! monotonically increasing request epoch. An invocation bumps the epoch, then
//! reads the cache and the backend concurrently:
//!
//! - the cached rows are surfaced only until a live result lands for the same
//!   epoch;
//! - a live result replaces whatever is surfaced and is written back to the
//!   cache;
//! - a live error leaves surfaced rows in place and is only reported when there
//!   is nothing to show;
//! - anything resolving for an epoch older than the slot's current one is
//!   dropped, including its cache write;
//! - a round dropped before its live result lands stops reporting `loading`.
//!
//! Slots nobody watches and nothing is fetching are pruned once the client
//! holds more than its idle-slot limit; their rows remain in the cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use portico_core::{GatewayResult, Mutation, Outcome, QueryDescriptor, Row};
use portico_gateway::BackendGateway;
use portico_storage::OfflineCache;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

/// Where the surfaced rows came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Cache,
    Live,
}

/// What a query key currently shows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryState {
    pub data: Option<Vec<Row>>,
    pub error: Option<String>,
    pub source: Option<DataSource>,
    /// A live fetch for the current epoch is outstanding.
    pub loading: bool,
}

impl QueryState {
    pub fn outcome(&self) -> Outcome<Vec<Row>> {
        match (&self.data, &self.error) {
            (Some(rows), _) => Outcome::data(rows.clone()),
            (None, Some(error)) => Outcome::error(error.clone()),
            (None, None) => Outcome::empty(),
        }
    }
}

#[derive(Debug, Default)]
struct EpochState {
    current: u64,
    /// A successful live result landed for `current`.
    live_applied: bool,
}

#[derive(Debug)]
struct Slot {
    epoch: Mutex<EpochState>,
    state: watch::Sender<QueryState>,
    /// Serializes the epoch check with the cache write.
    persist: tokio::sync::Mutex<()>,
}

impl Slot {
    fn new() -> Self {
        Self {
            epoch: Mutex::new(EpochState::default()),
            state: watch::channel(QueryState::default()).0,
            persist: tokio::sync::Mutex::new(()),
        }
    }

    fn begin(&self) -> u64 {
        let mut epoch = lock(&self.epoch);
        epoch.current += 1;
        epoch.live_applied = false;
        self.state.send_modify(|state| state.loading = true);
        epoch.current
    }

    /// Clear `loading` for a round that ended without resolving.
    fn abandon(&self, epoch: u64) {
        let current = lock(&self.epoch);
        if current.current != epoch {
            return;
        }
        self.state.send_if_modified(|state| std::mem::replace(&mut state.loading, false));
    }

    fn is_idle(&self) -> bool {
        self.state.receiver_count() == 0 && !self.state.borrow().loading
    }

    fn is_current(&self, epoch: u64) -> bool {
        lock(&self.epoch).current == epoch
    }

    fn offer_cached(&self, epoch: u64, rows: Vec<Row>) -> bool {
        let current = lock(&self.epoch);
        if current.current != epoch || current.live_applied {
            return false;
        }
        self.state.send_modify(|state| {
            state.data = Some(rows);
            state.error = None;
            state.source = Some(DataSource::Cache);
        });
        true
    }

    fn resolve_live(&self, epoch: u64, result: &GatewayResult<Vec<Row>>) -> bool {
        let mut current = lock(&self.epoch);
        if current.current != epoch {
            return false;
        }
        if result.is_ok() {
            current.live_applied = true;
        }
        self.state.send_modify(|state| {
            state.loading = false;
            match result {
                Ok(rows) => {
                    state.data = Some(rows.clone());
                    state.error = None;
                    state.source = Some(DataSource::Live);
                }
                Err(err) if state.data.is_none() => state.error = Some(err.to_string()),
                Err(_) => {}
            }
        });
        true
    }
}

/// Keeps a round's slot from reporting `loading` after the round is dropped.
struct RoundGuard<'a> {
    slot: &'a Slot,
    epoch: u64,
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.slot.abandon(self.epoch);
    }
}

pub const DEFAULT_IDLE_SLOT_LIMIT: usize = 256;

/// Read-through query orchestration over a gateway and an offline cache.
#[derive(Clone)]
pub struct QueryClient {
    gateway: BackendGateway,
    cache: OfflineCache,
    slots: Arc<Mutex<HashMap<String, Arc<Slot>>>>,
    idle_slot_limit: usize,
}

impl QueryClient {
    pub fn new(gateway: BackendGateway, cache: OfflineCache) -> Self {
        Self {
            gateway,
            cache,
            slots: Arc::new(Mutex::new(HashMap::new())),
            idle_slot_limit: DEFAULT_IDLE_SLOT_LIMIT,
        }
    }

    /// Number of slots kept before idle ones are pruned.
    pub fn with_idle_slot_limit(mut self, limit: usize) -> Self {
        self.idle_slot_limit = limit;
        self
    }

    pub fn cache(&self) -> &OfflineCache {
        &self.cache
    }

    /// Run one stale-while-revalidate round for `query` and return what the
    /// key shows once both sides of this round have resolved.
    ///
    /// If a newer round for the same key started meanwhile, the returned
    /// outcome is whatever that round has surfaced so far.
    pub async fn query(&self, query: &QueryDescriptor) -> Outcome<Vec<Row>> {
        let key = query.cache_key();
        let slot = self.slot(query);
        let epoch = slot.begin();
        let _round = RoundGuard { slot: &slot, epoch };

        let cached = async {
            if let Some(rows) = self.cache.get::<Vec<Row>>(key).await {
                if !slot.offer_cached(epoch, rows) {
                    debug!(key, epoch, "cached rows arrived after live result or newer round");
                }
            }
        };
        let live = async {
            let result = self.gateway.query(query).await;
            if !slot.resolve_live(epoch, &result) {
                debug!(key, epoch, "dropping superseded live result");
                return;
            }
            if let Ok(rows) = result {
                let _persist = slot.persist.lock().await;
                if slot.is_current(epoch) {
                    self.cache.set(key, &rows, None).await;
                } else {
                    debug!(key, epoch, "skipping cache write for superseded round");
                }
            }
        };
        tokio::join!(cached, live);

        let outcome = slot.state.borrow().outcome();
        outcome
    }

    /// Watch the surfaced state of `query`'s key.
    pub fn subscribe(&self, query: &QueryDescriptor) -> watch::Receiver<QueryState> {
        self.slot(query).state.subscribe()
    }

    /// Current surfaced state of `query`'s key.
    pub fn state(&self, query: &QueryDescriptor) -> QueryState {
        self.slot(query).state.borrow().clone()
    }

    /// Wait until no live fetch is outstanding for `query`'s key.
    pub async fn settled(&self, query: &QueryDescriptor) -> QueryState {
        let mut rx = self.subscribe(query);
        let settled = match rx.wait_for(|state| !state.loading).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(query),
        };
        settled
    }

    /// Drop the cached rows for `query`. Surfaced state is left alone.
    pub async fn invalidate(&self, query: &QueryDescriptor) {
        self.cache.remove(query.cache_key()).await;
    }

    /// Run a write. On success every cached query on the same table is
    /// invalidated.
    pub async fn mutate(&self, mutation: &Mutation) -> Outcome<Vec<Row>> {
        let result = self.gateway.mutate(mutation).await;
        if result.is_ok() {
            self.cache
                .remove_prefix(&mutation.table().query_cache_prefix())
                .await;
        }
        result.into()
    }

    fn slot(&self, query: &QueryDescriptor) -> Arc<Slot> {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get(query.cache_key()) {
            return slot.clone();
        }
        if slots.len() >= self.idle_slot_limit {
            let before = slots.len();
            slots.retain(|_, slot| Arc::strong_count(slot) > 1 || !slot.is_idle());
            debug!(pruned = before - slots.len(), kept = slots.len(), "pruned idle query slots");
        }
        let slot = Arc::new(Slot::new());
        slots.insert(query.cache_key().to_string(), slot.clone());
        slot
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("gateway", &self.gateway)
            .field("cache", &self.cache)
            .field("keys", &lock(&self.slots).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_core::QueryOptions;
    use portico_gateway::MemoryProvider;
    use portico_storage::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn client() -> (QueryClient, MemoryProvider, OfflineCache) {
        let memory = MemoryProvider::new();
        let cache = OfflineCache::new(
            Arc::new(MemoryStore::new()),
            "app_cache",
            Duration::from_secs(60),
        );
        let client = QueryClient::new(BackendGateway::new(Arc::new(memory.clone())), cache.clone());
        (client, memory, cache)
    }

    fn todos() -> QueryDescriptor {
        QueryDescriptor::new("todos", QueryOptions::new().eq("done", false)).unwrap()
    }

    #[tokio::test]
    async fn test_live_result_is_cached() {
        let (client, memory, cache) = client();
        memory.seed("todos", vec![json!({"id": "1", "done": false})]);

        let outcome = client.query(&todos()).await;
        assert_eq!(outcome.get_data(), Some(&vec![json!({"id": "1", "done": false})]));
        assert_eq!(client.state(&todos()).source, Some(DataSource::Live));

        let cached: Option<Vec<Row>> = cache.get(r#"query:todos:{"filter":{"done":false}}"#).await;
        assert_eq!(cached, Some(vec![json!({"id": "1", "done": false})]));
    }

    #[tokio::test]
    async fn test_error_without_cache_is_surfaced() {
        let (client, memory, _) = client();
        memory.set_reachable(false);
        let outcome = client.query(&todos()).await;
        assert!(outcome.get_data().is_none());
        assert!(outcome.get_error().unwrap().contains("unreachable"));
        assert!(!client.state(&todos()).loading);
    }

    #[tokio::test]
    async fn test_invalidate_and_mutate_clear_cache() {
        let (client, memory, cache) = client();
        memory.seed("todos", vec![json!({"id": "1", "done": false})]);
        client.query(&todos()).await;
        client.invalidate(&todos()).await;
        assert!(cache.get::<Vec<Row>>(todos().cache_key()).await.is_none());

        client.query(&todos()).await;
        let outcome = client
            .mutate(&Mutation::insert("todos", vec![json!({"done": false})]).unwrap())
            .await;
        assert_eq!(outcome.get_data().map(Vec::len), Some(1));
        assert!(cache.get::<Vec<Row>>(todos().cache_key()).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_mutation_keeps_cache() {
        let (client, memory, cache) = client();
        client.query(&todos()).await;
        memory.set_reachable(false);
        let outcome = client
            .mutate(&Mutation::insert("todos", vec![json!({"done": false})]).unwrap())
            .await;
        assert!(outcome.is_error());
        assert!(cache.get::<Vec<Row>>(todos().cache_key()).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_round_stops_loading() {
        let (client, memory, _) = client();
        memory.set_latency(Duration::from_secs(10));

        let round = tokio::spawn({
            let client = client.clone();
            async move { client.query(&todos()).await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(client.state(&todos()).loading);

        round.abort();
        assert!(round.await.unwrap_err().is_cancelled());
        assert!(!client.state(&todos()).loading);

        let settled = tokio::time::timeout(Duration::from_millis(500), client.settled(&todos())).await;
        assert!(settled.is_ok());
    }

    #[tokio::test]
    async fn test_idle_slots_are_pruned_but_still_invalidated() {
        let (client, memory, cache) = client();
        let client = client.with_idle_slot_limit(4);
        memory.seed("todos", vec![json!({"id": "1", "done": false})]);
        let paged = |limit: u32| {
            QueryDescriptor::new("todos", QueryOptions::new().eq("done", false).limit(limit)).unwrap()
        };

        let _watch = client.subscribe(&todos());
        for limit in 1..=10 {
            client.query(&paged(limit)).await;
        }
        {
            let slots = lock(&client.slots);
            assert!(slots.len() <= 4);
            assert!(slots.contains_key(todos().cache_key()));
            assert!(!slots.contains_key(paged(1).cache_key()));
        }
        assert!(cache.get::<Vec<Row>>(paged(1).cache_key()).await.is_some());

        client
            .mutate(&Mutation::insert("todos", vec![json!({"done": false})]).unwrap())
            .await;
        assert!(cache.get::<Vec<Row>>(paged(1).cache_key()).await.is_none());
        assert!(cache.get::<Vec<Row>>(paged(10).cache_key()).await.is_none());
    }
}
