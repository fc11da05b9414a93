//! Claim-level validation of decoded ID tokens.
//!
//! JWKS signature verification is intentionally not performed here; the
//! token body is decoded and its claims are checked against issuer, audience,
//! and clock-skew rules only. Callers must treat the claims as unverified
//! trust until a signature layer exists.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::ProviderConfig;

/// Claims decoded from the body of an ID token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub sub: String,
    pub aud: String,
    pub iss: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acr: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub iat: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub exp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
}

/// Reasons an ID token is rejected.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("token response contained no ID token")]
    MissingIdToken,
    #[error("ID token has no payload segment")]
    MissingPayload,
    #[error("ID token payload is not valid base64url: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("ID token claims could not be decoded: {0}")]
    Claims(#[from] serde_json::Error),
    #[error("issuer '{actual}' is not a prefix of the configured issuer '{expected}'")]
    IssuerMismatch { expected: String, actual: String },
    #[error("audience '{actual}' does not match client id '{expected}'")]
    AudienceMismatch { expected: String, actual: String },
    #[error("token expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("token issued too far in the future at {0}")]
    IssuedInFuture(DateTime<Utc>),
}

/// Decode the claim set from the second dot-separated segment of a JWT.
///
/// The segment is base64url; `=` padding is appended until the length is a
/// multiple of four before decoding.
pub fn decode_claims(id_token: &str) -> Result<IdTokenClaims, ValidationError> {
    let payload = id_token
        .split('.')
        .nth(1)
        .filter(|segment| !segment.is_empty())
        .ok_or(ValidationError::MissingPayload)?;
    let mut padded = payload.to_owned();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    let bytes = URL_SAFE.decode(padded.as_bytes())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Validates ID-token claims against the configured issuer, audience, and
/// clock-skew tolerance.
#[derive(Debug, Clone)]
pub struct TokenValidator {
    issuer: Url,
    client_id: String,
    clock_skew: Duration,
}

impl TokenValidator {
    pub fn new(issuer: Url, client_id: impl Into<String>, clock_skew: Duration) -> Self {
        Self {
            issuer,
            client_id: client_id.into(),
            clock_skew,
        }
    }

    pub fn for_config(config: &ProviderConfig) -> Self {
        Self::new(
            config.issuer.clone(),
            config.client_id.clone(),
            config.clock_skew,
        )
    }

    pub fn validate(&self, id_token: &str) -> Result<IdTokenClaims, ValidationError> {
        self.validate_at(id_token, Utc::now())
    }

    pub fn validate_at(
        &self,
        id_token: &str,
        now: DateTime<Utc>,
    ) -> Result<IdTokenClaims, ValidationError> {
        let claims = decode_claims(id_token)?;

        if !self.issuer.as_str().starts_with(&claims.iss) {
            return Err(ValidationError::IssuerMismatch {
                expected: self.issuer.to_string(),
                actual: claims.iss,
            });
        }
        if claims.aud != self.client_id {
            return Err(ValidationError::AudienceMismatch {
                expected: self.client_id.clone(),
                actual: claims.aud,
            });
        }
        if claims.exp - now < -self.clock_skew {
            return Err(ValidationError::Expired(claims.exp));
        }
        if claims.iat - now > self.clock_skew {
            return Err(ValidationError::IssuedInFuture(claims.iat));
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::make_id_token;

    fn validator() -> TokenValidator {
        TokenValidator::new(
            Url::parse("https://idp.example.com/realm").unwrap(),
            "client-id",
            Duration::seconds(120),
        )
    }

    fn claims_json(iat: DateTime<Utc>, exp: DateTime<Utc>) -> serde_json::Value {
        serde_json::json!({
            "sub": "user-1",
            "aud": "client-id",
            "iss": "https://idp.example.com",
            "acr": "pwd",
            "iat": iat.timestamp(),
            "exp": exp.timestamp(),
            "name": "Jane Doe",
        })
    }

    #[test]
    fn accepts_valid_token() {
        let now = Utc::now();
        let token = make_id_token(&claims_json(now, now + Duration::hours(1)));
        let claims = validator().validate_at(&token, now).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.acr.as_deref(), Some("pwd"));
    }

    #[test]
    fn accepts_unverified_signature() {
        // Signature verification is a known gap: garbage in the third
        // segment must not cause rejection.
        let now = Utc::now();
        let mut token = make_id_token(&claims_json(now, now + Duration::hours(1)));
        token.push_str("not-a-real-signature");
        assert!(validator().validate_at(&token, now).is_ok());
    }

    #[test]
    fn rejects_missing_payload() {
        let err = decode_claims("onlyonesegment").unwrap_err();
        assert!(matches!(err, ValidationError::MissingPayload));
        let err = decode_claims("header..sig").unwrap_err();
        assert!(matches!(err, ValidationError::MissingPayload));
    }

    #[test]
    fn rejects_invalid_base64() {
        let err = decode_claims("header.???.sig").unwrap_err();
        assert!(matches!(err, ValidationError::Base64(_)));
    }

    #[test]
    fn rejects_undecodable_claims() {
        let payload = URL_SAFE.encode(b"not json");
        let err = decode_claims(&format!("header.{payload}.sig")).unwrap_err();
        assert!(matches!(err, ValidationError::Claims(_)));
    }

    #[test]
    fn issuer_must_prefix_configured_url() {
        let now = Utc::now();
        let mut claims = claims_json(now, now + Duration::hours(1));
        claims["iss"] = serde_json::json!("https://other.example.com");
        let token = make_id_token(&claims);
        let err = validator().validate_at(&token, now).unwrap_err();
        assert!(matches!(err, ValidationError::IssuerMismatch { .. }));
    }

    #[test]
    fn audience_must_equal_client_id() {
        let now = Utc::now();
        let mut claims = claims_json(now, now + Duration::hours(1));
        claims["aud"] = serde_json::json!("someone-else");
        let token = make_id_token(&claims);
        let err = validator().validate_at(&token, now).unwrap_err();
        assert!(matches!(err, ValidationError::AudienceMismatch { .. }));
    }

    #[test]
    fn expiry_honours_clock_skew() {
        let now = Utc::now();
        // Expired 60s ago but within the 120s tolerance.
        let token = make_id_token(&claims_json(
            now - Duration::hours(1),
            now - Duration::seconds(60),
        ));
        assert!(validator().validate_at(&token, now).is_ok());

        let token = make_id_token(&claims_json(
            now - Duration::hours(1),
            now - Duration::seconds(180),
        ));
        let err = validator().validate_at(&token, now).unwrap_err();
        assert!(matches!(err, ValidationError::Expired(_)));
    }

    #[test]
    fn issued_at_honours_clock_skew() {
        let now = Utc::now();
        let token = make_id_token(&claims_json(
            now + Duration::seconds(60),
            now + Duration::hours(1),
        ));
        assert!(validator().validate_at(&token, now).is_ok());

        let token = make_id_token(&claims_json(
            now + Duration::seconds(300),
            now + Duration::hours(1),
        ));
        let err = validator().validate_at(&token, now).unwrap_err();
        assert!(matches!(err, ValidationError::IssuedInFuture(_)));
    }
}
