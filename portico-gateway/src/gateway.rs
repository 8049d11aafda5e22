//! The gateway facade.

use std::sync::Arc;

use portico_core::{
    AuthState, GatewayConfig, GatewayResult, Mutation, ProbeReport, QueryDescriptor, Row,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::capability::{
    AuthCapability, DbCapability, FunctionsCapability, ObjectPath, ProviderAdapter,
    RealtimeCapability, StorageCapability, UploadOptions,
};
use crate::providers::build_adapter;
use crate::realtime::{ChannelName, RealtimeConnection};

/// Single entry point to the active backend.
///
/// Holds one adapter, chosen at construction and never swapped. Cloning is
/// cheap and every clone talks to the same adapter. Failures are returned as
/// values and logged here once, so callers only decide what to render.
#[derive(Clone)]
pub struct BackendGateway {
    adapter: Arc<dyn ProviderAdapter>,
}

impl BackendGateway {
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self { adapter }
    }

    /// Build the adapter named by `config.provider`.
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let adapter = build_adapter(config)?;
        info!(provider = adapter.name(), "backend gateway ready");
        Ok(Self::new(adapter))
    }

    pub fn provider(&self) -> &str {
        self.adapter.name()
    }

    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    pub fn db(&self) -> &dyn DbCapability {
        self.adapter.db()
    }

    pub fn auth(&self) -> &dyn AuthCapability {
        self.adapter.auth()
    }

    pub fn realtime(&self) -> &dyn RealtimeCapability {
        self.adapter.realtime()
    }

    pub fn storage(&self) -> &dyn StorageCapability {
        self.adapter.storage()
    }

    pub fn functions(&self) -> &dyn FunctionsCapability {
        self.adapter.functions()
    }

    pub async fn query(&self, query: &QueryDescriptor) -> GatewayResult<Vec<Row>> {
        let result = self.db().query(query).await;
        match &result {
            Ok(rows) => debug!(provider = self.provider(), table = %query.table(), rows = rows.len(), "query"),
            Err(e) => warn!(provider = self.provider(), table = %query.table(), error = %e, "query failed"),
        }
        result
    }

    pub async fn mutate(&self, mutation: &Mutation) -> GatewayResult<Vec<Row>> {
        let result = self.db().mutate(mutation).await;
        if let Err(e) = &result {
            warn!(provider = self.provider(), table = %mutation.table(), error = %e, "mutation failed");
        }
        result
    }

    pub async fn get_session(&self) -> GatewayResult<AuthState> {
        let result = self.auth().get_session().await;
        if let Err(e) = &result {
            warn!(provider = self.provider(), error = %e, "session lookup failed");
        }
        result
    }

    pub fn restore_from_cookies(&self, cookie_header: &str) -> AuthState {
        let state = self.auth().restore_from_cookies(cookie_header);
        debug!(provider = self.provider(), authenticated = state.is_authenticated(), "session restored from cookies");
        state
    }

    pub async fn sign_out(&self) -> GatewayResult<()> {
        let result = self.auth().sign_out().await;
        if let Err(e) = &result {
            warn!(provider = self.provider(), error = %e, "sign-out failed");
        }
        result
    }

    pub async fn connect(&self, channel: &ChannelName) -> GatewayResult<RealtimeConnection> {
        let result = self.realtime().connect(channel).await;
        if let Err(e) = &result {
            warn!(provider = self.provider(), channel = %channel, error = %e, "realtime connect failed");
        }
        result
    }

    pub async fn upload(
        &self,
        object: &ObjectPath,
        bytes: Vec<u8>,
        options: &UploadOptions,
    ) -> GatewayResult<String> {
        let size = bytes.len();
        let result = self.storage().upload(object, bytes, options).await;
        if let Err(e) = &result {
            warn!(provider = self.provider(), bucket = object.bucket(), path = object.path(), size, error = %e, "upload failed");
        }
        result
    }

    pub async fn remove(&self, bucket: &str, paths: &[String]) -> GatewayResult<()> {
        let result = self.storage().remove(bucket, paths).await;
        if let Err(e) = &result {
            warn!(provider = self.provider(), bucket, count = paths.len(), error = %e, "remove failed");
        }
        result
    }

    pub fn public_url(&self, object: &ObjectPath) -> String {
        self.storage().public_url(object)
    }

    pub async fn invoke(&self, name: &str, body: Option<Value>) -> GatewayResult<Value> {
        let result = self.functions().invoke(name, body).await;
        if let Err(e) = &result {
            warn!(provider = self.provider(), function = name, error = %e, "function invocation failed");
        }
        result
    }

    /// Raw liveness probe; timing and thresholds are the health monitor's job.
    pub async fn ping(&self) -> GatewayResult<ProbeReport> {
        self.adapter.ping().await
    }
}

impl std::fmt::Debug for BackendGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendGateway")
            .field("provider", &self.provider())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MemoryProvider;
    use portico_core::{GatewayError, Outcome, QueryOptions};
    use serde_json::json;

    #[tokio::test]
    async fn test_from_config_selects_memory() {
        let gateway = BackendGateway::from_config(&GatewayConfig::memory()).unwrap();
        assert_eq!(gateway.provider(), "memory");
    }

    #[tokio::test]
    async fn test_failures_are_values() {
        let memory = MemoryProvider::new();
        memory.set_reachable(false);
        let gateway = BackendGateway::new(Arc::new(memory));
        let query = QueryDescriptor::new("todos", QueryOptions::new()).unwrap();

        let outcome: Outcome<Vec<Row>> = gateway.query(&query).await.into();
        assert!(outcome.is_error());
        assert!(outcome.get_data().is_none());

        let err = gateway.invoke("anything", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_clones_share_the_adapter() {
        let memory = MemoryProvider::new();
        let gateway = BackendGateway::new(Arc::new(memory.clone()));
        let copy = gateway.clone();
        copy.mutate(&Mutation::insert("todos", vec![json!({"id": "1"})]).unwrap())
            .await
            .unwrap();
        let query = QueryDescriptor::new("todos", QueryOptions::new()).unwrap();
        assert_eq!(gateway.query(&query).await.unwrap(), vec![json!({"id": "1"})]);
    }
}
