//! Supabase adapter.
//!
//! PostgREST for tables, the Storage and Edge Functions HTTP APIs, GoTrue for
//! sessions and the Phoenix websocket protocol for realtime.

mod auth;
mod realtime;
mod rest;

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use portico_core::{GatewayResult, ProbeReport, ReconnectConfig, Session};
use reqwest::RequestBuilder;

use crate::capability::{
    AuthCapability, DbCapability, FunctionsCapability, ProviderAdapter, RealtimeCapability,
    StorageCapability,
};
use crate::http::HttpClient;

pub use auth::parse_auth_cookie;
pub use rest::postgrest_params;

pub const PROVIDER_NAME: &str = "supabase";

pub struct SupabaseProvider {
    http: HttpClient,
    anon_key: String,
    project_ref: String,
    reconnect: ReconnectConfig,
    session: RwLock<Option<Session>>,
}

impl SupabaseProvider {
    pub fn new(
        url: &str,
        anon_key: &str,
        project_ref: &str,
        timeout: Duration,
        reconnect: ReconnectConfig,
    ) -> GatewayResult<Self> {
        Ok(Self {
            http: HttpClient::new(PROVIDER_NAME, url, timeout)?,
            anon_key: anon_key.to_string(),
            project_ref: project_ref.to_string(),
            reconnect,
            session: RwLock::new(None),
        })
    }

    /// Name of the auth cookie written by Supabase's SSR helpers.
    pub fn cookie_name(&self) -> String {
        format!("sb-{}-auth-token", self.project_ref)
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

    /// Attach the API key and the caller's bearer token (anon key when signed out).
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token().unwrap_or_else(|| self.anon_key.clone());
        request
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer)
    }
}

impl std::fmt::Debug for SupabaseProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseProvider")
            .field("http", &self.http)
            .field("project_ref", &self.project_ref)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProviderAdapter for SupabaseProvider {
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
        let request = self.authorize(self.http.client().get(self.http.url("/rest/v1/")));
        let response = self.http.send(request).await?;
        // PostgREST answers 503 while its schema cache reloads.
        if response.status().as_u16() == 503 {
            return Ok(ProbeReport::Degraded);
        }
        self.http.check_status(response).await?;
        Ok(ProbeReport::Healthy)
    }
}
