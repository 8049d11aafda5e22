use async_trait::async_trait;
use portico_core::{parse_cookie_header, AuthState, GatewayError, GatewayResult, Session};
use serde::Deserialize;
use tracing::debug;

use super::{PocketbaseProvider, AUTH_COOKIE, PROVIDER_NAME};
use crate::capability::AuthCapability;
use crate::providers::jwt::decode_claims;

#[derive(Debug, Deserialize)]
struct StoredAuth {
    token: String,
    /// `model` in older SDKs, `record` in newer ones.
    #[serde(default, alias = "record")]
    model: Option<AuthRecord>,
}

#[derive(Debug, Deserialize)]
struct AuthRecord {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    token: String,
    record: AuthRecord,
}

/// Rebuild the session stored in a `pb_auth` cookie.
pub fn parse_auth_cookie(cookie_header: &str) -> Option<Session> {
    let (_, raw) = parse_cookie_header(cookie_header)
        .into_iter()
        .find(|(name, _)| name == AUTH_COOKIE)?;
    let decoded = urlencoding::decode(&raw).ok()?;
    let stored: StoredAuth = serde_json::from_str(&decoded).ok()?;
    session_from_token(stored.token, stored.model.map(|record| record.id))
}

fn session_from_token(token: String, user_id: Option<String>) -> Option<Session> {
    let claims = decode_claims(&token).unwrap_or_default();
    let user_id = user_id.or_else(|| claims.subject().map(str::to_string))?;
    Some(Session {
        user_id,
        expires_at: claims.expires_at(),
        access_token: token,
    })
}

#[async_trait]
impl AuthCapability for PocketbaseProvider {
    async fn get_session(&self) -> GatewayResult<AuthState> {
        let current = self.session.read().ok().and_then(|s| s.clone());
        if !AuthState::from_session(current).is_authenticated() {
            self.set_session(None);
            return Ok(AuthState::Unauthenticated);
        }

        let url = self.http.url(&format!(
            "/api/collections/{}/auth-refresh",
            urlencoding::encode(&self.auth_collection)
        ));
        let request = self.authorize(self.http.client().post(url));
        match self.http.send_json::<RefreshResponse>(request).await {
            Ok(refreshed) => {
                let session = session_from_token(refreshed.token, Some(refreshed.record.id));
                let state = AuthState::from_session(session);
                self.set_session(state.session().cloned());
                Ok(state)
            }
            Err(GatewayError::Http { status: 401 | 403 | 404, .. }) => {
                debug!(provider = PROVIDER_NAME, "stored session rejected");
                self.set_session(None);
                Ok(AuthState::Unauthenticated)
            }
            Err(err) => Err(err),
        }
    }

    fn restore_from_cookies(&self, cookie_header: &str) -> AuthState {
        let state = AuthState::from_session(parse_auth_cookie(cookie_header));
        self.set_session(state.session().cloned());
        state
    }

    /// PocketBase tokens are stateless; signing out only forgets the token.
    async fn sign_out(&self) -> GatewayResult<()> {
        self.set_session(None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::jwt::encode_test_token;
    use serde_json::json;

    fn cookie(value: serde_json::Value) -> String {
        format!("{}={}", AUTH_COOKIE, urlencoding::encode(&value.to_string()))
    }

    #[test]
    fn test_model_cookie() {
        let token = encode_test_token(&json!({"id": "rec1", "exp": 4_000_000_000i64}));
        let header = cookie(json!({"token": token, "model": {"id": "rec1", "email": "a@b.c"}}));
        let session = parse_auth_cookie(&header).unwrap();
        assert_eq!(session.user_id, "rec1");
        assert_eq!(session.expires_at.unwrap().timestamp(), 4_000_000_000);
    }

    #[test]
    fn test_record_alias_and_token_fallback() {
        let token = encode_test_token(&json!({"id": "rec2", "exp": 4_000_000_000i64}));
        let with_record = cookie(json!({"token": token.clone(), "record": {"id": "rec2"}}));
        assert_eq!(parse_auth_cookie(&with_record).unwrap().user_id, "rec2");

        let token_only = cookie(json!({"token": token}));
        assert_eq!(parse_auth_cookie(&token_only).unwrap().user_id, "rec2");
    }

    #[test]
    fn test_expired_token_is_unauthenticated() {
        let provider = PocketbaseProvider::new(
            "http://127.0.0.1:8090",
            "users",
            std::time::Duration::from_secs(1),
            Default::default(),
        )
        .unwrap();
        let token = encode_test_token(&json!({"id": "rec1", "exp": 1}));
        let header = cookie(json!({"token": token, "model": {"id": "rec1"}}));
        assert_eq!(provider.restore_from_cookies(&header), AuthState::Unauthenticated);
        assert!(parse_auth_cookie("pb_auth=garbage").is_none());
    }
}
