//! Tracing subscriber setup.

use portico_core::TelemetryConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ClientError, ClientResult};

const DEFAULT_FILTER: &str = "portico_client=info,portico_gateway=info,portico_storage=warn,warn";

/// Install the global subscriber. `RUST_LOG` wins over the configured filter.
///
/// Call once at startup; a second call fails.
pub fn init_tracing(config: &TelemetryConfig) -> ClientResult<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.filter.as_deref().unwrap_or(DEFAULT_FILTER))
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    result.map_err(|e| ClientError::Telemetry(e.to_string()))?;

    tracing::debug!(json = config.json, filter = ?config.filter, "Telemetry initialized");
    Ok(())
}
