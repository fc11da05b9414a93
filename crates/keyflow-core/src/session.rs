use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::validator::{decode_claims, IdTokenClaims};

/// Derived usability of a session at a point in time. Never stored; always
/// recomputed from the decoded expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The ID token carries no decodable claims; the record is unusable.
    NoSession,
    Expired,
    Valid,
}

/// One authenticated principal's token set.
///
/// Sessions are replaced, never mutated in place: refresh and connectivity
/// transitions produce a new value via [`Session::with_online`] or a fresh
/// construction. The lifecycle manager holds the single long-lived reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Raw signed ID token as issued by the provider.
    pub id_token: String,
    /// Claim set decoded from `id_token`; `None` when undecodable.
    pub claims: Option<IdTokenClaims>,
    /// Whether the last refresh attempt succeeded over the network.
    #[serde(default = "default_online")]
    pub online: bool,
    #[serde(default = "default_created_at")]
    pub created_at: DateTime<Utc>,
}

fn default_online() -> bool {
    true
}

fn default_created_at() -> DateTime<Utc> {
    Utc::now()
}

impl Session {
    pub fn new(access_token: String, refresh_token: Option<String>, id_token: String) -> Self {
        let claims = decode_claims(&id_token).ok();
        Self {
            access_token,
            refresh_token,
            id_token,
            claims,
            online: true,
            created_at: Utc::now(),
        }
    }

    /// Copy of this session with the connectivity flag replaced.
    pub fn with_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn status(&self) -> SessionStatus {
        self.status_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> SessionStatus {
        match &self.claims {
            None => SessionStatus::NoSession,
            Some(claims) if now < claims.exp => SessionStatus::Valid,
            Some(_) => SessionStatus::Expired,
        }
    }

    /// Authentication context class reference from the ID token, if any.
    pub fn acr(&self) -> Option<&str> {
        self.claims
            .as_ref()
            .and_then(|claims| claims.acr.as_deref())
            .filter(|acr| !acr.is_empty())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{make_id_token, make_session};
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_valid_before_expiry() {
        let session = make_session(Duration::hours(1));
        assert_eq!(session.status(), SessionStatus::Valid);
        assert!(session.online);
    }

    #[test]
    fn status_expired_after_expiry() {
        let session = make_session(Duration::hours(-1));
        assert_eq!(session.status(), SessionStatus::Expired);
    }

    #[test]
    fn status_no_session_when_claims_undecodable() {
        let session = Session::new("access".into(), None, "garbage-token".into());
        assert!(session.claims.is_none());
        assert_eq!(session.status(), SessionStatus::NoSession);
    }

    #[test]
    fn status_boundary_at_exact_expiry() {
        let session = make_session(Duration::hours(1));
        let exp = session.claims.as_ref().unwrap().exp;
        assert_eq!(session.status_at(exp), SessionStatus::Expired);
        assert_eq!(
            session.status_at(exp - Duration::seconds(1)),
            SessionStatus::Valid
        );
    }

    #[test]
    fn with_online_replaces_flag_only() {
        let session = make_session(Duration::hours(1));
        let offline = session.clone().with_online(false);
        assert!(!offline.online);
        assert_eq!(offline.access_token, session.access_token);
    }

    #[test]
    fn acr_ignores_empty_values() {
        let now = Utc::now();
        let claims = serde_json::json!({
            "sub": "s", "aud": "a", "iss": "i",
            "iat": now.timestamp(), "exp": (now + Duration::hours(1)).timestamp(),
            "acr": "",
        });
        let session = Session::new("t".into(), None, make_id_token(&claims));
        assert!(session.acr().is_none());
    }
}
