//! Shared HTTP plumbing for the REST-speaking providers.

use std::time::Duration;

use portico_core::{GatewayError, GatewayResult};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Clone)]
pub(crate) struct HttpClient {
    provider: &'static str,
    client: reqwest::Client,
    /// No overall timeout; used for long-lived event streams.
    streaming: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpClient {
    pub(crate) fn new(
        provider: &'static str,
        base_url: &str,
        timeout: Duration,
    ) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::transport(provider, e.to_string()))?;
        let streaming = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| GatewayError::transport(provider, e.to_string()))?;
        Ok(Self {
            provider,
            client,
            streaming,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub(crate) fn provider(&self) -> &'static str {
        self.provider
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn streaming(&self) -> &reqwest::Client {
        &self.streaming
    }

    pub(crate) async fn send(&self, request: RequestBuilder) -> GatewayResult<Response> {
        request.send().await.map_err(|e| self.map_error(e))
    }

    /// Send and decode a JSON body, mapping non-2xx answers to `Http` errors.
    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> GatewayResult<T> {
        let response = self.send(request).await?;
        let response = self.check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::invalid_response(self.provider, e.to_string()))
    }

    /// Send and decode JSON, tolerating empty or non-JSON bodies.
    pub(crate) async fn send_value(&self, request: RequestBuilder) -> GatewayResult<Value> {
        let response = self.send(request).await?;
        let response = self.check_status(response).await?;
        let text = response.text().await.map_err(|e| self.map_error(e))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    /// Send, check the status, discard the body.
    pub(crate) async fn send_empty(&self, request: RequestBuilder) -> GatewayResult<()> {
        let response = self.send(request).await?;
        self.check_status(response).await?;
        Ok(())
    }

    pub(crate) async fn check_status(&self, response: Response) -> GatewayResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(GatewayError::http(
            self.provider,
            status.as_u16(),
            error_message(&text),
        ))
    }

    pub(crate) fn map_error(&self, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout {
                provider: self.provider.to_string(),
                elapsed: self.timeout,
            }
        } else if err.is_decode() {
            GatewayError::invalid_response(self.provider, err.to_string())
        } else {
            GatewayError::transport(self.provider, err.to_string())
        }
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Pull a human-readable message out of an error body.
///
/// Providers disagree on the field name; fall back to the raw text.
pub(crate) fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for field in ["message", "msg", "error_description", "error"] {
            if let Some(message) = value.get(field).and_then(Value::as_str) {
                return message.to_string();
            }
        }
    }
    if body.trim().is_empty() {
        "empty response body".to_string()
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_prefers_known_fields() {
        assert_eq!(error_message(r#"{"message":"nope","code":"42P01"}"#), "nope");
        assert_eq!(error_message(r#"{"msg":"bad jwt"}"#), "bad jwt");
        assert_eq!(error_message("plain text"), "plain text");
        assert_eq!(error_message(""), "empty response body");
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let client = HttpClient::new("supabase", "https://x.supabase.co/", Duration::from_secs(1))
            .unwrap();
        assert_eq!(client.url("/rest/v1/todos"), "https://x.supabase.co/rest/v1/todos");
    }
}
