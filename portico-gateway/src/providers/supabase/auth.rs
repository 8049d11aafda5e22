use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::DateTime;
use portico_core::{parse_cookie_header, AuthState, GatewayError, GatewayResult, Session};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{SupabaseProvider, PROVIDER_NAME};
use crate::capability::AuthCapability;
use crate::providers::jwt::decode_claims;

const BASE64_PREFIX: &str = "base64-";

#[derive(Debug, Deserialize)]
struct StoredSession {
    access_token: String,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    user: Option<StoredUser>,
}

#[derive(Debug, Deserialize)]
struct StoredUser {
    id: String,
}

/// Rebuild the session stored in a `sb-<ref>-auth-token` cookie.
///
/// The value may be split over `<name>.0`, `<name>.1`, ... chunks, may be
/// URL-encoded, and may carry a `base64-` prefix. The JSON inside is either a
/// session object or the legacy `[access_token, refresh_token, ...]` array.
pub fn parse_auth_cookie(cookie_header: &str, cookie_name: &str) -> Option<Session> {
    let cookies = parse_cookie_header(cookie_header);
    let raw = match cookies.iter().find(|(name, _)| name == cookie_name) {
        Some((_, value)) => value.clone(),
        None => join_chunks(&cookies, cookie_name)?,
    };
    let decoded = urlencoding::decode(&raw).ok()?.into_owned();
    let json = match decoded.strip_prefix(BASE64_PREFIX) {
        Some(encoded) => decode_base64(encoded)?,
        None => decoded,
    };
    session_from_json(&json)
}

fn join_chunks(cookies: &[(String, String)], cookie_name: &str) -> Option<String> {
    let mut joined = String::new();
    for index in 0.. {
        let chunk_name = format!("{}.{}", cookie_name, index);
        match cookies.iter().find(|(name, _)| *name == chunk_name) {
            Some((_, value)) => joined.push_str(value),
            None => break,
        }
    }
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

fn decode_base64(encoded: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .or_else(|_| STANDARD.decode(encoded))
        .ok()?;
    String::from_utf8(bytes).ok()
}

fn session_from_json(json: &str) -> Option<Session> {
    let value: Value = serde_json::from_str(json).ok()?;
    let (access_token, expires_at, user_id) = match value {
        Value::Array(items) => {
            let token = items.first()?.as_str()?.to_string();
            (token, None, None)
        }
        object @ Value::Object(_) => {
            let stored: StoredSession = serde_json::from_value(object).ok()?;
            (
                stored.access_token,
                stored.expires_at,
                stored.user.map(|user| user.id),
            )
        }
        _ => return None,
    };

    let claims = decode_claims(&access_token).unwrap_or_default();
    let user_id = user_id.or_else(|| claims.subject().map(str::to_string))?;
    let expires_at = expires_at
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .or_else(|| claims.expires_at());
    Some(Session {
        user_id,
        access_token,
        expires_at,
    })
}

#[async_trait]
impl AuthCapability for SupabaseProvider {
    async fn get_session(&self) -> GatewayResult<AuthState> {
        let current = match self.session.read().ok().and_then(|s| s.clone()) {
            Some(session) => session,
            None => return Ok(AuthState::Unauthenticated),
        };
        if !AuthState::from_session(Some(current.clone())).is_authenticated() {
            self.set_session(None);
            return Ok(AuthState::Unauthenticated);
        }

        let request = self.authorize(self.http.client().get(self.http.url("/auth/v1/user")));
        let user: Value = match self.http.send_json(request).await {
            Ok(user) => user,
            Err(GatewayError::Http { status: 401 | 403, .. }) => {
                debug!(provider = PROVIDER_NAME, "stored session rejected");
                self.set_session(None);
                return Ok(AuthState::Unauthenticated);
            }
            Err(err) => return Err(err),
        };

        let user_id = user
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(current.user_id.clone());
        let session = Session { user_id, ..current };
        self.set_session(Some(session.clone()));
        Ok(AuthState::from_session(Some(session)))
    }

    fn restore_from_cookies(&self, cookie_header: &str) -> AuthState {
        let session = parse_auth_cookie(cookie_header, &self.cookie_name());
        let state = AuthState::from_session(session);
        self.set_session(state.session().cloned());
        state
    }

    async fn sign_out(&self) -> GatewayResult<()> {
        let had_session = self.access_token().is_some();
        if !had_session {
            return Ok(());
        }
        let request = self.authorize(self.http.client().post(self.http.url("/auth/v1/logout")));
        self.set_session(None);
        if let Err(err) = self.http.send_empty(request).await {
            warn!(provider = PROVIDER_NAME, error = %err, "remote sign-out failed; local session cleared");
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::jwt::encode_test_token;
    use serde_json::json;

    const NAME: &str = "sb-abc-auth-token";

    fn stored(expires_at: i64) -> String {
        json!({
            "access_token": encode_test_token(&json!({"sub": "u1"})),
            "expires_at": expires_at,
            "user": {"id": "u1"}
        })
        .to_string()
    }

    #[test]
    fn test_url_encoded_json_cookie() {
        let header = format!("{}={}", NAME, urlencoding::encode(&stored(4_000_000_000)));
        let session = parse_auth_cookie(&header, NAME).unwrap();
        assert_eq!(session.user_id, "u1");
        assert_eq!(session.expires_at.unwrap().timestamp(), 4_000_000_000);
    }

    #[test]
    fn test_base64_chunked_cookie() {
        let encoded = format!("base64-{}", URL_SAFE_NO_PAD.encode(stored(4_000_000_000)));
        let (first, second) = encoded.split_at(encoded.len() / 2);
        let header = format!("other=1; {NAME}.0={first}; {NAME}.1={second}");
        let session = parse_auth_cookie(&header, NAME).unwrap();
        assert_eq!(session.user_id, "u1");
    }

    #[test]
    fn test_legacy_array_uses_token_claims() {
        let token = encode_test_token(&json!({"sub": "u2", "exp": 4_000_000_000i64}));
        let value = json!([token, "refresh", null, null, null]).to_string();
        let header = format!("{}={}", NAME, urlencoding::encode(&value));
        let session = parse_auth_cookie(&header, NAME).unwrap();
        assert_eq!(session.user_id, "u2");
        assert!(session.expires_at.is_some());
    }

    #[test]
    fn test_missing_or_garbage_cookie() {
        assert!(parse_auth_cookie("theme=dark", NAME).is_none());
        assert!(parse_auth_cookie(&format!("{}=%7Bbroken", NAME), NAME).is_none());
    }

    #[test]
    fn test_expired_cookie_is_unauthenticated() {
        let provider = SupabaseProvider::new(
            "https://abc.supabase.co",
            "anon",
            "abc",
            std::time::Duration::from_secs(1),
            Default::default(),
        )
        .unwrap();
        let header = format!("{}={}", NAME, urlencoding::encode(&stored(1)));
        assert_eq!(provider.restore_from_cookies(&header), AuthState::Unauthenticated);
        assert!(provider.access_token().is_none());
    }
}
