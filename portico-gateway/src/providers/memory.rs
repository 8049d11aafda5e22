//! In-process backend.
//!
//! Tables, objects, functions and broadcast channels all live in memory. Used
//! for offline development and as the backend of most tests; the toggles let
//! tests make it slow, degraded or unreachable.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use portico_core::{
    matches_filter, parse_cookie_header, AuthState, GatewayError, GatewayResult, Mutation,
    MutationKind, ProbeReport, QueryDescriptor, Row, Session,
};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::capability::{
    AuthCapability, DbCapability, FunctionsCapability, ObjectPath, ProviderAdapter,
    RealtimeCapability, StorageCapability, UploadOptions,
};
use crate::realtime::{ChannelName, RealtimeConnection, RealtimeEvent, EVENT_DELETE, EVENT_INSERT, EVENT_UPDATE};

pub const PROVIDER_NAME: &str = "memory";

/// Cookie carrying the user id of a memory-backend session.
pub const SESSION_COOKIE: &str = "portico-memory-session";

const CHANNEL_CAPACITY: usize = 256;

/// Origin id of events published by the backend itself (row changes).
const BACKEND_ORIGIN: u64 = 0;

type FunctionHandler = Arc<dyn Fn(Option<Value>) -> GatewayResult<Value> + Send + Sync>;

/// In-memory provider adapter. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    inner: Arc<MemoryBackend>,
}

#[derive(Default)]
struct MemoryBackend {
    tables: RwLock<BTreeMap<String, Vec<Row>>>,
    objects: RwLock<BTreeMap<(String, String), Vec<u8>>>,
    functions: RwLock<HashMap<String, FunctionHandler>>,
    channels: Mutex<HashMap<String, broadcast::Sender<(u64, RealtimeEvent)>>>,
    next_origin: AtomicU64,
    session: RwLock<Option<Session>>,
    unreachable: AtomicBool,
    degraded: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents of `table`.
    pub fn seed(&self, table: &str, rows: Vec<Row>) {
        if let Ok(mut tables) = self.inner.tables.write() {
            tables.insert(table.to_string(), rows);
        }
    }

    /// Current contents of `table`.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .tables
            .read()
            .ok()
            .and_then(|tables| tables.get(table).cloned())
            .unwrap_or_default()
    }

    pub fn object(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.inner
            .objects
            .read()
            .ok()?
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
    }

    pub fn register_function<F>(&self, name: &str, handler: F)
    where
        F: Fn(Option<Value>) -> GatewayResult<Value> + Send + Sync + 'static,
    {
        if let Ok(mut functions) = self.inner.functions.write() {
            functions.insert(name.to_string(), Arc::new(handler));
        }
    }

    /// While unreachable every operation fails with a transport error.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Make pings report a degraded backend.
    pub fn set_degraded(&self, degraded: bool) {
        self.inner.degraded.store(degraded, Ordering::SeqCst);
    }

    /// Artificial delay applied to every operation.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_session(&self, session: Option<Session>) {
        if let Ok(mut slot) = self.inner.session.write() {
            *slot = session;
        }
    }

    /// Publish an event to every connection on `channel`, as the server would.
    pub fn publish(&self, channel: &ChannelName, event: RealtimeEvent) {
        self.broadcast(channel.as_str(), BACKEND_ORIGIN, event);
    }

    async fn enter(&self) -> GatewayResult<()> {
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::transport(PROVIDER_NAME, "backend unreachable"));
        }
        Ok(())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<(u64, RealtimeEvent)> {
        let mut channels = self
            .inner
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn broadcast(&self, channel: &str, origin: u64, event: RealtimeEvent) {
        // No receivers is fine; nobody is listening yet.
        let _ = self.sender(channel).send((origin, event));
    }

    fn publish_row_changes(&self, table: &str, event: &str, rows: &[Row]) {
        let channel = format!("{}{}", crate::realtime::DB_CHANNEL_PREFIX, table);
        for row in rows {
            self.broadcast(&channel, BACKEND_ORIGIN, RealtimeEvent::new(event, row.clone()));
        }
    }

    fn write_tables<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Vec<Row>>) -> GatewayResult<R>,
    ) -> GatewayResult<R> {
        let mut tables = self
            .inner
            .tables
            .write()
            .map_err(|_| GatewayError::transport(PROVIDER_NAME, "table lock poisoned"))?;
        f(&mut tables)
    }
}

impl std::fmt::Debug for MemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryProvider").finish_non_exhaustive()
    }
}

fn with_id(row: &Row) -> Row {
    let mut row = row.clone();
    if let Some(object) = row.as_object_mut() {
        if !object.contains_key("id") {
            object.insert("id".to_string(), Value::String(Uuid::now_v7().to_string()));
        }
    }
    row
}

fn merge(target: &mut Row, values: &Map<String, Value>) {
    if let Some(object) = target.as_object_mut() {
        for (key, value) in values {
            object.insert(key.clone(), value.clone());
        }
    }
}

fn same_id(a: &Row, b: &Row) -> bool {
    matches!((a.get("id"), b.get("id")), (Some(x), Some(y)) if x == y)
}

#[async_trait]
impl DbCapability for MemoryProvider {
    async fn query(&self, query: &QueryDescriptor) -> GatewayResult<Vec<Row>> {
        self.enter().await?;
        Ok(query.apply(&self.rows(query.table().as_str())))
    }

    async fn mutate(&self, mutation: &Mutation) -> GatewayResult<Vec<Row>> {
        self.enter().await?;
        let table = mutation.table().as_str();
        let (event, affected) = self.write_tables(|tables| {
            let rows = tables.entry(table.to_string()).or_default();
            match mutation.kind() {
                MutationKind::Insert { rows: new_rows } => {
                    let new_rows: Vec<Row> = new_rows.iter().map(with_id).collect();
                    if new_rows
                        .iter()
                        .any(|new| rows.iter().any(|existing| same_id(existing, new)))
                    {
                        return Err(GatewayError::http(PROVIDER_NAME, 409, "duplicate key"));
                    }
                    rows.extend(new_rows.iter().cloned());
                    Ok((EVENT_INSERT, new_rows))
                }
                MutationKind::Upsert { rows: new_rows } => {
                    let mut affected = Vec::with_capacity(new_rows.len());
                    for new in new_rows.iter().map(with_id) {
                        match rows.iter_mut().find(|existing| same_id(existing, &new)) {
                            Some(existing) => {
                                if let Some(values) = new.as_object() {
                                    merge(existing, values);
                                }
                                affected.push(existing.clone());
                            }
                            None => {
                                rows.push(new.clone());
                                affected.push(new);
                            }
                        }
                    }
                    Ok((EVENT_UPDATE, affected))
                }
                MutationKind::Update { filter, values } => {
                    let mut affected = Vec::new();
                    for row in rows.iter_mut().filter(|row| matches_filter(filter, row)) {
                        merge(row, values);
                        affected.push(row.clone());
                    }
                    Ok((EVENT_UPDATE, affected))
                }
                MutationKind::Delete { filter } => {
                    let (removed, kept): (Vec<Row>, Vec<Row>) = rows
                        .drain(..)
                        .partition(|row| matches_filter(filter, row));
                    *rows = kept;
                    Ok((EVENT_DELETE, removed))
                }
            }
        })?;
        self.publish_row_changes(table, event, &affected);
        Ok(affected)
    }
}

#[async_trait]
impl AuthCapability for MemoryProvider {
    async fn get_session(&self) -> GatewayResult<AuthState> {
        self.enter().await?;
        let session = self.inner.session.read().ok().and_then(|s| s.clone());
        Ok(AuthState::from_session(session))
    }

    fn restore_from_cookies(&self, cookie_header: &str) -> AuthState {
        let session = parse_cookie_header(cookie_header)
            .into_iter()
            .find(|(name, value)| name == SESSION_COOKIE && !value.is_empty())
            .map(|(_, user_id)| Session {
                access_token: format!("memory-{}", user_id),
                user_id,
                expires_at: None,
            });
        self.set_session(session.clone());
        AuthState::from_session(session)
    }

    async fn sign_out(&self) -> GatewayResult<()> {
        self.set_session(None);
        Ok(())
    }
}

#[async_trait]
impl RealtimeCapability for MemoryProvider {
    async fn connect(&self, channel: &ChannelName) -> GatewayResult<RealtimeConnection> {
        self.enter().await?;
        let origin = self.inner.next_origin.fetch_add(1, Ordering::SeqCst) + 1;
        let sender = self.sender(channel.as_str());
        let mut inbound = sender.subscribe();
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<RealtimeEvent>(CHANNEL_CAPACITY);
        let name = channel.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = inbound.recv() => match received {
                        Ok((from, event)) => {
                            if from == origin {
                                continue;
                            }
                            if events_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(channel = %name, skipped, "memory channel lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    outgoing = outbound_rx.recv() => match outgoing {
                        Some(event) => {
                            let _ = sender.send((origin, event));
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(RealtimeConnection::new(
            PROVIDER_NAME,
            events_rx,
            Some(outbound_tx),
            task,
        ))
    }
}

#[async_trait]
impl StorageCapability for MemoryProvider {
    async fn upload(
        &self,
        object: &ObjectPath,
        bytes: Vec<u8>,
        options: &UploadOptions,
    ) -> GatewayResult<String> {
        self.enter().await?;
        let key = (object.bucket().to_string(), object.path().to_string());
        let mut objects = self
            .inner
            .objects
            .write()
            .map_err(|_| GatewayError::transport(PROVIDER_NAME, "object lock poisoned"))?;
        if objects.contains_key(&key) && !options.upsert {
            return Err(GatewayError::http(PROVIDER_NAME, 409, "object already exists"));
        }
        objects.insert(key, bytes);
        Ok(self.public_url(object))
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> GatewayResult<()> {
        self.enter().await?;
        let mut objects = self
            .inner
            .objects
            .write()
            .map_err(|_| GatewayError::transport(PROVIDER_NAME, "object lock poisoned"))?;
        for path in paths {
            objects.remove(&(bucket.to_string(), path.clone()));
        }
        Ok(())
    }

    fn public_url(&self, object: &ObjectPath) -> String {
        format!("memory://{}/{}", object.bucket(), object.path())
    }
}

#[async_trait]
impl FunctionsCapability for MemoryProvider {
    async fn invoke(&self, name: &str, body: Option<Value>) -> GatewayResult<Value> {
        self.enter().await?;
        let handler = self
            .inner
            .functions
            .read()
            .ok()
            .and_then(|functions| functions.get(name).cloned())
            .ok_or_else(|| {
                GatewayError::http(PROVIDER_NAME, 404, format!("function '{}' not found", name))
            })?;
        handler(body)
    }
}

#[async_trait]
impl ProviderAdapter for MemoryProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn db(&self) -> &dyn DbCapability {
        self
    }

    fn auth(&self) -> &dyn AuthCapability {
        self
    }

    fn realtime(&self) -> &dyn RealtimeCapability {
        self
    }

    fn storage(&self) -> &dyn StorageCapability {
        self
    }

    fn functions(&self) -> &dyn FunctionsCapability {
        self
    }

    async fn ping(&self) -> GatewayResult<ProbeReport> {
        self.enter().await?;
        if self.inner.degraded.load(Ordering::SeqCst) {
            Ok(ProbeReport::Degraded)
        } else {
            Ok(ProbeReport::Healthy)
        }
    }
}
