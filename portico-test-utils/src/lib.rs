//! portico test utilities
//!
//! Shared test infrastructure for the portico workspace:
//! - `ScriptedAdapter`, a provider whose db calls are answered by the test
//! - Proptest generators for queries and filters
//! - Fixtures for common scenarios
//! - Assertions for gateway errors

pub use portico_core::{
    AuthState, Filter, GatewayConfig, GatewayError, GatewayResult, Mutation, QueryDescriptor,
    QueryOptions, Row, Session,
};
pub use portico_gateway::{BackendGateway, MemoryProvider};
pub use portico_storage::{MemoryStore, OfflineCache};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use portico_core::ProbeReport;
use portico_gateway::{
    AuthCapability, DbCapability, FunctionsCapability, ProviderAdapter, RealtimeCapability,
    StorageCapability,
};
use tokio::sync::{mpsc, oneshot, Mutex};

// ============================================================================
// SCRIPTED PROVIDER
// ============================================================================

/// A db request captured by [`ScriptedAdapter`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedRequest {
    Query(QueryDescriptor),
    Mutate(Mutation),
}

/// One in-flight db call. The caller stays suspended until the test answers.
#[derive(Debug)]
pub struct ScriptedCall {
    pub request: ScriptedRequest,
    responder: oneshot::Sender<GatewayResult<Vec<Row>>>,
}

impl ScriptedCall {
    pub fn respond(self, result: GatewayResult<Vec<Row>>) {
        // The caller may have given up already.
        let _ = self.responder.send(result);
    }

    pub fn ok(self, rows: Vec<Row>) {
        self.respond(Ok(rows));
    }

    pub fn fail(self, message: &str) {
        self.respond(Err(GatewayError::transport("scripted", message)));
    }
}

/// Receiving end for calls made against a [`ScriptedAdapter`].
#[derive(Debug, Clone)]
pub struct ScriptedCalls {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<ScriptedCall>>>,
}

impl ScriptedCalls {
    /// Wait for the next db call.
    ///
    /// # Panics
    ///
    /// Panics if no call arrives within five seconds.
    pub async fn next(&self) -> ScriptedCall {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a scripted db call")
            .expect("scripted adapter dropped")
    }

    /// A call that is already waiting, if any.
    pub async fn try_next(&self) -> Option<ScriptedCall> {
        self.rx.lock().await.try_recv().ok()
    }
}

/// Provider whose `db` calls suspend until the test answers them, in any order.
///
/// Everything other than `db` is served by an inner [`MemoryProvider`].
#[derive(Debug, Clone)]
pub struct ScriptedAdapter {
    memory: MemoryProvider,
    calls: mpsc::UnboundedSender<ScriptedCall>,
}

impl ScriptedAdapter {
    pub fn new() -> (Self, ScriptedCalls) {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = Self {
            memory: MemoryProvider::new(),
            calls: tx,
        };
        let calls = ScriptedCalls {
            rx: Arc::new(Mutex::new(rx)),
        };
        (adapter, calls)
    }

    pub fn memory(&self) -> &MemoryProvider {
        &self.memory
    }

    /// Gateway over this adapter, plus the handle answering its db calls.
    pub fn gateway() -> (BackendGateway, ScriptedCalls, MemoryProvider) {
        let (adapter, calls) = Self::new();
        let memory = adapter.memory.clone();
        (BackendGateway::new(Arc::new(adapter)), calls, memory)
    }

    async fn call(&self, request: ScriptedRequest) -> GatewayResult<Vec<Row>> {
        let (responder, response) = oneshot::channel();
        self.calls
            .send(ScriptedCall { request, responder })
            .map_err(|_| GatewayError::transport("scripted", "no test is listening"))?;
        response
            .await
            .unwrap_or_else(|_| Err(GatewayError::transport("scripted", "call dropped unanswered")))
    }
}

#[async_trait]
impl DbCapability for ScriptedAdapter {
    async fn query(&self, query: &QueryDescriptor) -> GatewayResult<Vec<Row>> {
        self.call(ScriptedRequest::Query(query.clone())).await
    }

    async fn mutate(&self, mutation: &Mutation) -> GatewayResult<Vec<Row>> {
        self.call(ScriptedRequest::Mutate(mutation.clone())).await
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn db(&self) -> &dyn DbCapability {
        self
    }

    fn auth(&self) -> &dyn AuthCapability {
        &self.memory
    }

    fn realtime(&self) -> &dyn RealtimeCapability {
        &self.memory
    }

    fn storage(&self) -> &dyn StorageCapability {
        &self.memory
    }

    fn functions(&self) -> &dyn FunctionsCapability {
        &self.memory
    }

    async fn ping(&self) -> GatewayResult<ProbeReport> {
        self.memory.ping().await
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for query inputs.

    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    pub fn arb_table_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,15}"
    }

    /// Column names usable as filter keys.
    pub fn arb_column() -> impl Strategy<Value = String> {
        "[a-z][a-z_]{0,10}".prop_filter("reserved filter key", |column| {
            !matches!(
                column.as_str(),
                "and" | "or" | "not" | "select" | "order" | "limit" | "offset"
            )
        })
    }

    /// Scalar JSON values as they appear in equality filters.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| Value::from(n)),
            "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
        ]
    }

    pub fn arb_filter() -> impl Strategy<Value = Filter> {
        prop::collection::btree_map(arb_column(), arb_scalar(), 0..4)
    }

    pub fn arb_query_options() -> impl Strategy<Value = QueryOptions> {
        (
            arb_filter(),
            prop::option::of((arb_column(), any::<bool>())),
            prop::option::of(1u32..100),
            prop::option::of(0u32..100),
        )
            .prop_map(|(filter, order, limit, offset)| {
                let mut options = QueryOptions {
                    filter,
                    ..QueryOptions::default()
                };
                if let Some((column, ascending)) = order {
                    options = options.order_by(column, ascending);
                }
                options.limit = limit;
                options.offset = offset;
                options
            })
    }

    pub fn arb_query() -> impl Strategy<Value = QueryDescriptor> {
        (arb_table_name(), arb_query_options()).prop_map(|(table, options)| {
            QueryDescriptor::new(table, options).expect("generated query is valid")
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made values for common scenarios.

    use super::*;
    use serde_json::json;

    pub fn todo(id: &str, done: bool) -> Row {
        json!({ "id": id, "title": format!("todo {}", id), "done": done })
    }

    /// `todos` filtered on `done`.
    pub fn todos_query(done: bool) -> QueryDescriptor {
        QueryDescriptor::new("todos", QueryOptions::new().eq("done", done))
            .expect("fixture query is valid")
    }

    pub fn eq_filter(column: &str, value: serde_json::Value) -> Filter {
        let mut filter = Filter::new();
        filter.insert(column.to_string(), value);
        filter
    }

    /// Memory provider and a gateway over it.
    pub fn memory_gateway() -> (BackendGateway, MemoryProvider) {
        let memory = MemoryProvider::new();
        (BackendGateway::new(Arc::new(memory.clone())), memory)
    }

    /// Offline cache over a fresh in-memory store, with the default namespace.
    pub fn memory_cache() -> (OfflineCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let cache = OfflineCache::new(
            store.clone(),
            portico_core::DEFAULT_CACHE_NAMESPACE,
            Duration::from_millis(portico_core::DEFAULT_CACHE_TTL_MS),
        );
        (cache, store)
    }

    pub fn session(user_id: &str) -> Session {
        Session {
            user_id: user_id.to_string(),
            access_token: format!("token-{}", user_id),
            expires_at: None,
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on gateway results.

    use super::*;

    pub fn assert_transport_error<T: std::fmt::Debug>(result: &GatewayResult<T>) {
        match result {
            Err(err) if err.is_transport() => {}
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    pub fn assert_http_status<T: std::fmt::Debug>(result: &GatewayResult<T>, expected: u16) {
        match result {
            Err(GatewayError::Http { status, .. }) if *status == expected => {}
            other => panic!("expected HTTP {} error, got {:?}", expected, other),
        }
    }

    pub fn assert_unsupported<T: std::fmt::Debug>(result: &GatewayResult<T>) {
        assert!(
            matches!(result, Err(GatewayError::Unsupported { .. })),
            "expected unsupported error, got {:?}",
            result
        );
    }
}
