//! Provider-neutral authentication state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An authenticated session, whatever cookie format it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// The only auth signal consumers see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AuthState {
    Authenticated(Session),
    Unauthenticated,
}

impl AuthState {
    /// Expired sessions collapse to `Unauthenticated`.
    pub fn from_session(session: Option<Session>) -> Self {
        match session {
            Some(session) if !session.is_expired_at(Utc::now()) => Self::Authenticated(session),
            _ => Self::Unauthenticated,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            Self::Authenticated(session) => Some(session),
            Self::Unauthenticated => None,
        }
    }
}

/// Parse a `Cookie:` header value into name/value pairs, in order.
pub fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(expires_in: i64) -> Session {
        Session {
            user_id: "u1".to_string(),
            access_token: "token".to_string(),
            expires_at: Some(Utc::now() + Duration::seconds(expires_in)),
        }
    }

    #[test]
    fn test_expired_session_is_unauthenticated() {
        assert!(!AuthState::from_session(Some(session(-10))).is_authenticated());
        assert!(AuthState::from_session(Some(session(3600))).is_authenticated());
        assert!(!AuthState::from_session(None).is_authenticated());
    }

    #[test]
    fn test_parse_cookie_header() {
        let cookies = parse_cookie_header("a=1; pb_auth={\"token\":\"x\"}; ; b = 2");
        assert_eq!(
            cookies,
            vec![
                ("a".to_string(), "1".to_string()),
                ("pb_auth".to_string(), "{\"token\":\"x\"}".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
        );
    }
}
