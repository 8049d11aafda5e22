//! Application context owning the process-wide client state.

use std::sync::Arc;

use portico_core::{GatewayConfig, ValidationError};
use portico_gateway::BackendGateway;
use portico_storage::{KeyValueStore, LmdbStore, MemoryStore, OfflineCache};
use tracing::info;

use crate::error::ClientResult;
use crate::flags::FeatureFlags;
use crate::health::HealthMonitor;
use crate::multiplexer::ChannelMultiplexer;
use crate::query::QueryClient;

/// Everything a UI layer needs, built once from configuration.
///
/// The gateway is fixed for the life of the context. Flags, cache and query
/// slots live here instead of in globals; clone the pieces you hand out.
pub struct AppContext {
    config: GatewayConfig,
    gateway: BackendGateway,
    store: Arc<dyn KeyValueStore>,
    cache: OfflineCache,
    flags: Arc<FeatureFlags>,
    health: HealthMonitor,
    channels: ChannelMultiplexer,
    queries: QueryClient,
}

impl AppContext {
    /// Build the context and hydrate persisted flag overrides.
    ///
    /// Uses an LMDB store when `cache.path` is set, an in-memory one otherwise.
    pub async fn from_config(config: GatewayConfig) -> ClientResult<Self> {
        let gateway = BackendGateway::from_config(&config)?;
        let store: Arc<dyn KeyValueStore> = match &config.cache.path {
            Some(path) => Arc::new(LmdbStore::open(path, config.cache.map_size_mb)?),
            None => Arc::new(MemoryStore::new()),
        };
        let context = Self::assemble(config, gateway, store);
        let loaded = context.flags.load_flag_overrides().await;
        info!(
            provider = context.gateway.provider(),
            store = context.store.name(),
            flag_overrides = loaded,
            "app context ready"
        );
        Ok(context)
    }

    /// Wire a context around an existing gateway and store. Flag overrides are
    /// not loaded.
    pub fn assemble(
        config: GatewayConfig,
        gateway: BackendGateway,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let cache = OfflineCache::new(
            store.clone(),
            config.cache.namespace.clone(),
            config.cache.default_ttl(),
        );
        let flags = Arc::new(FeatureFlags::new(store.clone()));
        flags.define_flags(config.flags.clone());
        let health = HealthMonitor::new(gateway.clone(), &config.health);
        let channels = ChannelMultiplexer::new(gateway.clone());
        let queries = QueryClient::new(gateway.clone(), cache.clone());
        Self {
            config,
            gateway,
            store,
            cache,
            flags,
            health,
            channels,
            queries,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn gateway(&self) -> &BackendGateway {
        &self.gateway
    }

    pub fn cache(&self) -> &OfflineCache {
        &self.cache
    }

    pub fn flags(&self) -> &Arc<FeatureFlags> {
        &self.flags
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn channels(&self) -> &ChannelMultiplexer {
        &self.channels
    }

    pub fn queries(&self) -> &QueryClient {
        &self.queries
    }

    /// Start health polling at the configured interval.
    pub fn start_health_monitor(&self) -> Result<bool, ValidationError> {
        self.health.start(self.config.health.interval())
    }

    /// Stop timers and close realtime channels.
    pub fn shutdown(&self) {
        self.health.stop();
        self.channels.unsubscribe_all();
        info!("app context shut down");
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("provider", &self.gateway.provider())
            .field("store", &self.store.name())
            .field("cache", &self.cache)
            .field("health", &self.health)
            .finish()
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.health.stop();
        self.channels.unsubscribe_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::FLAGS_STORAGE_KEY;

    #[tokio::test]
    async fn test_memory_context_defines_flags() {
        let mut config = GatewayConfig::memory();
        config.flags.insert("beta".to_string(), true);
        let context = AppContext::from_config(config).await.unwrap();
        assert_eq!(context.gateway().provider(), "memory");
        assert!(context.flags().is_enabled("beta"));
        assert_eq!(context.cache().namespace(), "app_cache");
    }

    #[tokio::test]
    async fn test_lmdb_context_persists_overrides_across_contexts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::memory();
        config.cache.path = Some(dir.path().join("cache"));
        config.cache.map_size_mb = 16;

        {
            let context = AppContext::from_config(config.clone()).await.unwrap();
            context.flags().set_flag_override("dark", true).await.unwrap();
        }

        let context = AppContext::from_config(config).await.unwrap();
        assert!(context.flags().is_enabled("dark"));
        assert!(context.store.get(FLAGS_STORAGE_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let context = AppContext::from_config(GatewayConfig::memory()).await.unwrap();
        assert_eq!(context.start_health_monitor(), Ok(true));
        assert_eq!(context.start_health_monitor(), Ok(false));
        context.shutdown();
        assert!(!context.health().is_running());
    }
}
