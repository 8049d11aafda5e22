//! PocketBase adapter.
//!
//! Records and files API over HTTP, auth from the `pb_auth` cookie, realtime
//! over server-sent events.

mod auth;
mod realtime;
mod records;
pub mod sse;

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use portico_core::{GatewayResult, ProbeReport, ReconnectConfig, Session};
use reqwest::RequestBuilder;
use serde::Deserialize;

use crate::capability::{
    AuthCapability, DbCapability, FunctionsCapability, ProviderAdapter, RealtimeCapability,
    StorageCapability,
};
use crate::http::HttpClient;

pub use auth::parse_auth_cookie;
pub use records::{filter_expression, page_window};

pub const PROVIDER_NAME: &str = "pocketbase";

/// Cookie written by the PocketBase JS SDK's `exportToCookie`.
pub const AUTH_COOKIE: &str = "pb_auth";

pub struct PocketbaseProvider {
    http: HttpClient,
    auth_collection: String,
    reconnect: ReconnectConfig,
    session: RwLock<Option<Session>>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    code: u16,
}

impl PocketbaseProvider {
    pub fn new(
        url: &str,
        auth_collection: &str,
        timeout: Duration,
        reconnect: ReconnectConfig,
    ) -> GatewayResult<Self> {
        Ok(Self {
            http: HttpClient::new(PROVIDER_NAME, url, timeout)?,
            auth_collection: auth_collection.to_string(),
            reconnect,
            session: RwLock::new(None),
        })
    }

    fn access_token(&self) -> Option<String> {
        self.session
            .read()
            .ok()
            .and_then(|session| session.as_ref().map(|s| s.access_token.clone()))
    }

    fn set_session(&self, session: Option<Session>) {
        if let Ok(mut slot) = self.session.write() {
            *slot = session;
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.access_token() {
            Some(token) => request.header("Authorization", token),
            None => request,
        }
    }
}

impl std::fmt::Debug for PocketbaseProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PocketbaseProvider")
            .field("http", &self.http)
            .field("auth_collection", &self.auth_collection)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProviderAdapter for PocketbaseProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn db(&self) -> &dyn DbCapability {
        self
    }

    fn auth(&self) -> &dyn AuthCapability {
        self
    }

    fn realtime(&self) -> &dyn RealtimeCapability {
        self
    }

    fn storage(&self) -> &dyn StorageCapability {
        self
    }

    fn functions(&self) -> &dyn FunctionsCapability {
        self
    }

    async fn ping(&self) -> GatewayResult<ProbeReport> {
        let request = self.http.client().get(self.http.url("/api/health"));
        let health: HealthResponse = self.http.send_json(request).await?;
        if health.code == 0 || health.code == 200 {
            Ok(ProbeReport::Healthy)
        } else {
            Ok(ProbeReport::Degraded)
        }
    }
}
