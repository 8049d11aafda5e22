//! Capability traits.
//!
//! One trait per capability, one implementation per provider. A provider
//! adapter bundles all five and answers health pings; [`BackendGateway`]
//! holds exactly one adapter for the life of the process.
//!
//! Every async method resolves to a [`GatewayResult`]. Adapters never panic on
//! I/O and never leak provider error types; failures come back as
//! [`GatewayError`](portico_core::GatewayError) values.
//!
//! [`BackendGateway`]: crate::gateway::BackendGateway

use async_trait::async_trait;
use portico_core::{
    AuthState, GatewayResult, Mutation, ProbeReport, QueryDescriptor, Row, ValidationError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::realtime::{ChannelName, RealtimeConnection};

/// Table reads and writes.
#[async_trait]
pub trait DbCapability: Send + Sync {
    /// Run a read and return the matching rows.
    async fn query(&self, query: &QueryDescriptor) -> GatewayResult<Vec<Row>>;

    /// Run a write and return the affected rows as the server now has them.
    async fn mutate(&self, mutation: &Mutation) -> GatewayResult<Vec<Row>>;
}

/// Session handling.
///
/// Adapters translate their provider's cookie and token formats into the
/// provider-neutral [`AuthState`].
#[async_trait]
pub trait AuthCapability: Send + Sync {
    /// Current session, verified against the provider where it supports it.
    async fn get_session(&self) -> GatewayResult<AuthState>;

    /// Adopt the session carried by a `Cookie:` header, if any.
    fn restore_from_cookies(&self, cookie_header: &str) -> AuthState;

    /// Drop the local session and tell the provider where it supports it.
    async fn sign_out(&self) -> GatewayResult<()>;
}

/// Realtime transport.
#[async_trait]
pub trait RealtimeCapability: Send + Sync {
    /// Open one transport connection bound to `channel`.
    ///
    /// The first connection attempt happens before this returns. Later
    /// disruptions are retried inside the transport with backoff.
    async fn connect(&self, channel: &ChannelName) -> GatewayResult<RealtimeConnection>;
}

/// Object storage.
#[async_trait]
pub trait StorageCapability: Send + Sync {
    /// Upload `bytes` and return the object's public URL.
    async fn upload(
        &self,
        object: &ObjectPath,
        bytes: Vec<u8>,
        options: &UploadOptions,
    ) -> GatewayResult<String>;

    /// Delete objects from one bucket.
    async fn remove(&self, bucket: &str, paths: &[String]) -> GatewayResult<()>;

    /// Public URL of an object. Pure; no request is made.
    fn public_url(&self, object: &ObjectPath) -> String;
}

/// Server-side functions.
#[async_trait]
pub trait FunctionsCapability: Send + Sync {
    async fn invoke(&self, name: &str, body: Option<Value>) -> GatewayResult<Value>;
}

/// A complete backend provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider identifier, e.g. "supabase".
    fn name(&self) -> &str;

    fn db(&self) -> &dyn DbCapability;
    fn auth(&self) -> &dyn AuthCapability;
    fn realtime(&self) -> &dyn RealtimeCapability;
    fn storage(&self) -> &dyn StorageCapability;
    fn functions(&self) -> &dyn FunctionsCapability;

    /// Cheapest request that proves the backend is answering.
    async fn ping(&self) -> GatewayResult<ProbeReport>;
}

/// Bucket plus object path, validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectPath {
    bucket: String,
    path: String,
}

impl ObjectPath {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Result<Self, ValidationError> {
        let bucket = bucket.into();
        let path = path.into();
        if bucket.trim().is_empty() {
            return Err(ValidationError::missing("bucket"));
        }
        if bucket.contains('/') {
            return Err(ValidationError::invalid("bucket", "must not contain '/'"));
        }
        if path.trim().is_empty() {
            return Err(ValidationError::missing("path"));
        }
        if path.starts_with('/') {
            return Err(ValidationError::invalid("path", "must be relative"));
        }
        if path.split('/').any(|segment| segment == ".." || segment.is_empty()) {
            return Err(ValidationError::invalid(
                "path",
                "must not contain empty or '..' segments",
            ));
        }
        Ok(Self { bucket, path })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Upload knobs shared by every provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    /// Overwrite an existing object instead of failing.
    pub upsert: bool,
}

impl UploadOptions {
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path_validation() {
        assert!(ObjectPath::new("avatars", "u1/me.png").is_ok());
        assert!(ObjectPath::new("", "me.png").is_err());
        assert!(ObjectPath::new("a/b", "me.png").is_err());
        assert!(ObjectPath::new("avatars", "").is_err());
        assert!(ObjectPath::new("avatars", "/abs.png").is_err());
        assert!(ObjectPath::new("avatars", "u1/../x.png").is_err());
        assert!(ObjectPath::new("avatars", "u1//x.png").is_err());
    }
}
