//! Error types for portico operations

use std::time::Duration;
use thiserror::Error;

/// Input validation errors.
///
/// Raised synchronously by argument constructors, before any I/O starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::RequiredFieldMissing {
            field: field.into(),
        }
    }
}

/// Errors returned by gateway capabilities.
///
/// These travel back to callers as values; no gateway operation panics or
/// aborts the caller's task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Transport error talking to {provider}: {message}")]
    Transport { provider: String, message: String },

    #[error("Request to {provider} timed out after {elapsed:?}")]
    Timeout { provider: String, elapsed: Duration },

    #[error("Request to {provider} failed with status {status}: {message}")]
    Http {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("{operation} is not supported by {provider}")]
    Unsupported { provider: String, operation: String },

    #[error("Not authenticated with {provider}")]
    Unauthenticated { provider: String },
}

impl GatewayError {
    pub fn transport(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn http(provider: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            provider: provider.into(),
            status,
            message: message.into(),
        }
    }

    pub fn invalid_response(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            provider: provider.into(),
            operation: operation.into(),
        }
    }

    /// Whether the failure came from the network path rather than the server's answer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }
}

/// Local persistence errors.
///
/// Never surfaced past the cache or flag layers; callers see a miss or a no-op.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Storage quota exceeded for key {key}")]
    QuotaExceeded { key: String },

    #[error("Corrupt record under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or PORTICO_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all portico errors.
#[derive(Debug, Error)]
pub enum PorticoError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for portico operations.
pub type PorticoResult<T> = Result<T, PorticoError>;

/// Result type returned by every gateway capability.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_display_http() {
        let err = GatewayError::http("supabase", 404, "relation does not exist");
        let msg = err.to_string();
        assert!(msg.contains("supabase"));
        assert!(msg.contains("404"));
        assert!(msg.contains("relation does not exist"));
    }

    #[test]
    fn test_gateway_error_is_transport() {
        assert!(GatewayError::transport("memory", "offline").is_transport());
        assert!(GatewayError::Timeout {
            provider: "memory".to_string(),
            elapsed: Duration::from_millis(10),
        }
        .is_transport());
        assert!(!GatewayError::http("memory", 500, "boom").is_transport());
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::invalid("table", "must not be empty");
        let msg = err.to_string();
        assert!(msg.contains("table"));
        assert!(msg.contains("must not be empty"));
    }

    #[test]
    fn test_portico_error_from_variants() {
        let validation = PorticoError::from(ValidationError::missing("bucket"));
        assert!(matches!(validation, PorticoError::Validation(_)));

        let gateway = PorticoError::from(GatewayError::unsupported("pocketbase", "send"));
        assert!(matches!(gateway, PorticoError::Gateway(_)));

        let persistence = PorticoError::from(PersistenceError::QuotaExceeded {
            key: "app_cache:x".to_string(),
        });
        assert!(matches!(persistence, PorticoError::Persistence(_)));

        let config = PorticoError::from(ConfigError::MissingConfigPath);
        assert!(matches!(config, PorticoError::Config(_)));
    }
}
