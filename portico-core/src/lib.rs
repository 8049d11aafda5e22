//! portico core - shared types
//!
//! Errors, configuration, query descriptors, session and health types used by
//! every other portico crate. No I/O lives here.

pub mod config;
pub mod error;
pub mod health;
pub mod outcome;
pub mod query;
pub mod session;

pub use config::{
    CacheConfig, GatewayConfig, HealthConfig, ProviderConfig, ReconnectConfig, TelemetryConfig,
    DEFAULT_CACHE_NAMESPACE, DEFAULT_CACHE_TTL_MS,
};
pub use error::{
    ConfigError, GatewayError, GatewayResult, PersistenceError, PorticoError, PorticoResult,
    ValidationError,
};
pub use health::{HealthState, HealthStatus, ProbeReport};
pub use outcome::{MutationResult, Outcome};
pub use query::{
    matches_filter, Filter, Mutation, MutationKind, OrderBy, QueryDescriptor, QueryOptions, Row,
    TableName,
};
pub use session::{parse_cookie_header, AuthState, Session};
