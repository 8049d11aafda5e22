//! portico gateway - one interface over interchangeable backends
//!
//! [`BackendGateway`] fronts exactly one [`ProviderAdapter`], selected from
//! configuration at startup. Adapters implement the five capabilities (db,
//! auth, realtime, storage, functions) for one vendor each:
//!
//! - [`providers::supabase`]: PostgREST, Storage, Edge Functions, Phoenix realtime
//! - [`providers::pocketbase`]: records and files API, SSE realtime
//! - [`providers::memory`]: in-process backend for development and tests

pub mod capability;
pub mod gateway;
mod http;
pub mod providers;
pub mod realtime;

pub use capability::{
    AuthCapability, DbCapability, FunctionsCapability, ObjectPath, ProviderAdapter,
    RealtimeCapability, StorageCapability, UploadOptions,
};
pub use gateway::BackendGateway;
pub use providers::{build_adapter, MemoryProvider, PocketbaseProvider, SupabaseProvider};
pub use realtime::{
    Backoff, ChannelName, RealtimeConnection, RealtimeEvent, RealtimePublisher, TransportGuard,
    DB_CHANNEL_PREFIX, EVENT_DELETE, EVENT_INSERT, EVENT_UPDATE,
};
