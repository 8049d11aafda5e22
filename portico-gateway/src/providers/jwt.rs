//! Minimal JWT claim reading.
//!
//! Signatures are not checked here; the provider does that when the token is
//! used. We only need `sub` and `exp` to build a local session.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub(crate) struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    /// PocketBase puts the record id here instead of `sub`.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
}

impl Claims {
    pub(crate) fn subject(&self) -> Option<&str> {
        self.sub.as_deref().or(self.id.as_deref())
    }

    pub(crate) fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| DateTime::from_timestamp(exp, 0))
    }
}

pub(crate) fn decode_claims(token: &str) -> Option<Claims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
pub(crate) fn encode_test_token(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{}.{}.signature", header, body)
}
