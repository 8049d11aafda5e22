//! portico client - what a UI layer talks to
//!
//! Wraps a [`BackendGateway`](portico_gateway::BackendGateway) with the
//! stateful pieces: stale-while-revalidate queries, optimistic collections,
//! feature flags, health polling and realtime channel handles. [`AppContext`]
//! owns one of each.

pub mod context;
pub mod error;
pub mod flags;
pub mod health;
pub mod multiplexer;
pub mod optimistic;
pub mod query;
pub mod telemetry;

pub use context::AppContext;
pub use error::{ClientError, ClientResult};
pub use flags::{FeatureFlags, FlagName, FLAGS_STORAGE_KEY};
pub use health::{HealthMonitor, HealthSubscription};
pub use multiplexer::{ChannelHandle, ChannelMultiplexer, ChannelState, ANY_EVENT};
pub use optimistic::{OptimisticCollection, DEFAULT_ID_FIELD};
pub use query::{DataSource, QueryClient, QueryState};
pub use telemetry::init_tracing;
