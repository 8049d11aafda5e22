//! Provider adapters.
//!
//! One module per backend. [`build_adapter`] is the only place that maps a
//! configured provider to its implementation.

mod jwt;
pub mod memory;
pub mod pocketbase;
pub mod supabase;

use std::sync::Arc;

use portico_core::{GatewayConfig, GatewayResult, ProviderConfig};

use crate::capability::ProviderAdapter;

pub use memory::MemoryProvider;
pub use pocketbase::PocketbaseProvider;
pub use supabase::SupabaseProvider;

/// Construct the adapter selected by `config.provider`.
pub fn build_adapter(config: &GatewayConfig) -> GatewayResult<Arc<dyn ProviderAdapter>> {
    let adapter: Arc<dyn ProviderAdapter> = match &config.provider {
        ProviderConfig::Supabase {
            url,
            anon_key,
            project_ref,
        } => Arc::new(SupabaseProvider::new(
            url,
            anon_key,
            project_ref,
            config.request_timeout(),
            config.reconnect.clone(),
        )?),
        ProviderConfig::Pocketbase {
            url,
            auth_collection,
        } => Arc::new(PocketbaseProvider::new(
            url,
            auth_collection,
            config.request_timeout(),
            config.reconnect.clone(),
        )?),
        ProviderConfig::Memory => Arc::new(MemoryProvider::new()),
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_adapter_matches_config() {
        let adapter = build_adapter(&GatewayConfig::memory()).unwrap();
        assert_eq!(adapter.name(), "memory");

        let mut config = GatewayConfig::memory();
        config.provider = ProviderConfig::Pocketbase {
            url: "http://127.0.0.1:8090".to_string(),
            auth_collection: "users".to_string(),
        };
        assert_eq!(build_adapter(&config).unwrap().name(), "pocketbase");
    }
}
