//! Configuration loading for portico.
//!
//! Provider and transport fields are required. Cache, health and telemetry
//! sections fall back to documented defaults.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CACHE_NAMESPACE: &str = "app_cache";
pub const DEFAULT_CACHE_TTL_MS: u64 = 30 * 60 * 1000;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub provider: ProviderConfig,
    pub request_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub health: HealthConfig,
    /// Compiled flag defaults, fed to `define_flags` at startup.
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Which backend the gateway talks to. Chosen once, at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    Supabase {
        url: String,
        anon_key: String,
        project_ref: String,
    },
    Pocketbase {
        url: String,
        #[serde(default = "default_auth_collection")]
        auth_collection: String,
    },
    Memory,
}

impl ProviderConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Supabase { .. } => "supabase",
            Self::Pocketbase { .. } => "pocketbase",
            Self::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// LMDB directory. Without one the cache lives in memory only.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    #[serde(default = "default_map_size_mb")]
    pub map_size_mb: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            namespace: default_namespace(),
            default_ttl_ms: default_ttl_ms(),
            map_size_mb: default_map_size_mb(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_degraded_latency_ms")]
    pub degraded_latency_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            degraded_latency_ms: default_degraded_latency_ms(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn degraded_latency(&self) -> Duration {
        Duration::from_millis(self.degraded_latency_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Emit JSON log lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default)]
    pub filter: Option<String>,
}

impl GatewayConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// In-process configuration used for offline development and tests.
    pub fn memory() -> Self {
        Self {
            provider: ProviderConfig::Memory,
            request_timeout_ms: 5_000,
            reconnect: ReconnectConfig::default(),
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
            flags: BTreeMap::new(),
            telemetry: TelemetryConfig::default(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.provider {
            ProviderConfig::Supabase {
                url,
                anon_key,
                project_ref,
            } => {
                require_url("provider.url", url)?;
                require_non_empty("provider.anon_key", anon_key)?;
                require_non_empty("provider.project_ref", project_ref)?;
            }
            ProviderConfig::Pocketbase {
                url,
                auth_collection,
            } => {
                require_url("provider.url", url)?;
                require_non_empty("provider.auth_collection", auth_collection)?;
            }
            ProviderConfig::Memory => {}
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.reconnect.initial_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.initial_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.max_ms",
                reason: "must be >= initial_ms".to_string(),
            });
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.multiplier",
                reason: "must be >= 1.0".to_string(),
            });
        }
        require_non_empty("cache.namespace", &self.cache.namespace)?;
        if self.cache.default_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.default_ttl_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.map_size_mb",
                reason: "must be > 0".to_string(),
            });
        }
        if self.health.interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "health.interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.health.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "health.timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

fn require_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    require_non_empty(field, value)?;
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must start with http:// or https://".to_string(),
        });
    }
    Ok(())
}

fn default_auth_collection() -> String {
    "users".to_string()
}

fn default_namespace() -> String {
    DEFAULT_CACHE_NAMESPACE.to_string()
}

fn default_ttl_ms() -> u64 {
    DEFAULT_CACHE_TTL_MS
}

fn default_map_size_mb() -> usize {
    64
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_health_timeout_ms() -> u64 {
    5_000
}

fn default_degraded_latency_ms() -> u64 {
    1_000
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("PORTICO_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUPABASE: &str = r#"
        request_timeout_ms = 5000

        [provider]
        kind = "supabase"
        url = "https://abc.supabase.co"
        anon_key = "anon"
        project_ref = "abc"

        [reconnect]
        initial_ms = 250
        max_ms = 5000
        multiplier = 1.5
        jitter_ms = 100

        [flags]
        new_editor = true
    "#;

    #[test]
    fn test_parses_supabase_config_with_defaults() {
        let config = GatewayConfig::from_toml(SUPABASE).unwrap();
        assert_eq!(config.provider.name(), "supabase");
        assert_eq!(config.cache.namespace, "app_cache");
        assert_eq!(config.cache.default_ttl(), Duration::from_secs(1800));
        assert_eq!(config.flags.get("new_editor"), Some(&true));
        assert!(config.cache.path.is_none());
    }

    #[test]
    fn test_parses_memory_provider() {
        let contents = r#"
            request_timeout_ms = 1000
            [provider]
            kind = "memory"
            [reconnect]
            initial_ms = 100
            max_ms = 100
            multiplier = 1.0
            jitter_ms = 0
        "#;
        let config = GatewayConfig::from_toml(contents).unwrap();
        assert_eq!(config.provider, ProviderConfig::Memory);
    }

    #[test]
    fn test_rejects_bad_reconnect() {
        let mut config = GatewayConfig::memory();
        config.reconnect.max_ms = 10;
        config.reconnect.initial_ms = 100;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::memory();
        config.reconnect.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_http_url() {
        let mut config = GatewayConfig::memory();
        config.provider = ProviderConfig::Pocketbase {
            url: "ftp://pb".to_string(),
            auth_collection: "users".to_string(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let contents = format!("surprise = 1\n{}", SUPABASE);
        assert!(GatewayConfig::from_toml(&contents).is_err());
    }
}
