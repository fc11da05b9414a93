use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use crate::config::ProviderConfig;
use crate::pkce::PkcePair;

const DEFAULT_USER_AGENT: &str = "keyflow/0.1.0";
const REFRESH_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Errors raised by discovery and token-endpoint calls.
///
/// The three failure classes matter to callers: network-class errors are
/// recoverable (the session survives offline), server-class errors are 5xx
/// responses, and oauth-class errors are explicit rejections by the
/// authorization server.
#[derive(Debug, Error)]
pub enum OidcError {
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("authorization server rejected the request ({error}){}", description.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    Oauth {
        error: String,
        description: Option<String>,
    },
    #[error("invalid token type '{0}'")]
    InvalidTokenType(String),
    #[error("invalid response from provider: {0}")]
    InvalidResponse(String),
    #[error("HTTP client error: {0}")]
    Http(#[source] reqwest::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl OidcError {
    pub fn is_network(&self) -> bool {
        matches!(self, OidcError::Network(_))
    }

    pub fn is_server(&self) -> bool {
        matches!(self, OidcError::Server { .. })
    }
}

/// Subset of the OIDC discovery document the lifecycle needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    #[serde(default)]
    pub end_session_endpoint: Option<Url>,
}

/// Tokens returned by a code exchange or refresh.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Vec<String>,
    pub received_at: DateTime<Utc>,
}

/// Performs OIDC discovery and token exchanges against the provider.
#[derive(Debug)]
pub struct OidcClient {
    http: Client,
    config: ProviderConfig,
    discovery_url: Url,
    metadata: Mutex<Option<ProviderMetadata>>,
}

impl OidcClient {
    pub fn new(config: ProviderConfig) -> Result<Self, OidcError> {
        let discovery_url = default_discovery_url(&config.issuer)?;
        Self::with_discovery_url(config, discovery_url)
    }

    /// Override the discovery document location; used by tests and by
    /// providers that publish metadata off-issuer.
    pub fn with_discovery_url(config: ProviderConfig, discovery_url: Url) -> Result<Self, OidcError> {
        let http = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(OidcError::Http)?;
        Ok(Self {
            http,
            config,
            discovery_url,
            metadata: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Fetch (or return the cached) provider discovery document.
    pub async fn discover(&self) -> Result<ProviderMetadata, OidcError> {
        let mut cached = self.metadata.lock().await;
        if let Some(metadata) = cached.as_ref() {
            return Ok(metadata.clone());
        }
        debug!(url = %self.discovery_url, "fetching provider discovery document");
        let response = self
            .http
            .get(self.discovery_url.clone())
            .send()
            .await
            .map_err(OidcError::Network)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OidcError::Server {
                status: status.as_u16(),
                body,
            });
        }
        let metadata: ProviderMetadata = response
            .json()
            .await
            .map_err(|err| OidcError::InvalidResponse(err.to_string()))?;
        *cached = Some(metadata.clone());
        Ok(metadata)
    }

    /// Build the authorization URL for a browser-delegated login.
    pub fn authorization_url(
        &self,
        metadata: &ProviderMetadata,
        pkce: &PkcePair,
        state: &str,
        extra_scopes: &[String],
        extra_params: &[(&str, String)],
    ) -> Url {
        let mut url = metadata.authorization_endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("response_type", "code");
            pairs.append_pair("client_id", &self.config.client_id);
            pairs.append_pair("redirect_uri", self.config.redirect_uri.as_str());
            let mut scopes = self.config.scopes.clone();
            scopes.extend(extra_scopes.iter().cloned());
            if !scopes.is_empty() {
                pairs.append_pair("scope", &scopes.join(" "));
            }
            pairs.append_pair("code_challenge", pkce.challenge());
            pairs.append_pair("code_challenge_method", "S256");
            pairs.append_pair("state", state);
            for (key, value) in extra_params {
                pairs.append_pair(key, value);
            }
        }
        url
    }

    /// Build the end-session URL, if the provider advertises one.
    pub fn end_session_url(&self, metadata: &ProviderMetadata, id_token_hint: &str) -> Option<Url> {
        let mut url = metadata.end_session_endpoint.clone()?;
        url.query_pairs_mut()
            .append_pair("id_token_hint", id_token_hint)
            .append_pair(
                "post_logout_redirect_uri",
                self.config.post_logout_redirect_uri.as_str(),
            );
        Some(url)
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str, pkce: &PkcePair) -> Result<TokenSet, OidcError> {
        let metadata = self.discover().await?;
        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_owned()),
            (
                "redirect_uri".to_string(),
                self.config.redirect_uri.to_string(),
            ),
            ("code_verifier".to_string(), pkce.verifier().to_owned()),
            ("client_id".to_string(), self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret".to_string(), secret.clone()));
        }

        let response = self
            .http
            .post(metadata.token_endpoint.clone())
            .form(&form)
            .send()
            .await
            .map_err(OidcError::Network)?;

        handle_token_response(response).await
    }

    /// Refresh tokens using a refresh token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, OidcError> {
        let metadata = self.discover().await?;
        let mut form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_owned()),
            ("client_id".to_string(), self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret".to_string(), secret.clone()));
        }

        let response = self
            .http
            .post(metadata.token_endpoint.clone())
            .form(&form)
            .timeout(REFRESH_TIMEOUT)
            .send()
            .await
            .map_err(OidcError::Network)?;

        handle_token_response(response).await
    }
}

fn default_discovery_url(issuer: &Url) -> Result<Url, OidcError> {
    let base = issuer.as_str().trim_end_matches('/');
    Ok(Url::parse(&format!(
        "{base}/.well-known/openid-configuration"
    ))?)
}

async fn handle_token_response(response: reqwest::Response) -> Result<TokenSet, OidcError> {
    let status = response.status();
    let received_at = Utc::now();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(OidcError::Server {
                status: status.as_u16(),
                body,
            });
        }
        if let Ok(oauth) = serde_json::from_str::<OauthErrorBody>(&body) {
            return Err(OidcError::Oauth {
                error: oauth.error,
                description: oauth.error_description,
            });
        }
        return Err(OidcError::Oauth {
            error: "invalid_request".to_string(),
            description: Some(body),
        });
    }

    let payload: TokenResponse = response
        .json()
        .await
        .map_err(|err| OidcError::InvalidResponse(err.to_string()))?;
    payload.into_token_set(received_at)
}

#[derive(Debug, Deserialize)]
struct OauthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    id_token: Option<String>,
    token_type: String,
    expires_in: Option<i64>,
    scope: Option<String>,
}

impl TokenResponse {
    fn into_token_set(self, received_at: DateTime<Utc>) -> Result<TokenSet, OidcError> {
        if !self.token_type.eq_ignore_ascii_case("bearer") {
            return Err(OidcError::InvalidTokenType(self.token_type));
        }

        let expires_at = self
            .expires_in
            .map(|seconds| received_at + Duration::seconds(seconds));

        let scope = self
            .scope
            .unwrap_or_default()
            .split_whitespace()
            .map(ToOwned::to_owned)
            .collect();

        Ok(TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            id_token: self.id_token,
            expires_at,
            scope,
            received_at,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use httpmock::MockServer;

    pub fn test_config(redirect: &str) -> ProviderConfig {
        ProviderConfig::new(
            "client-id",
            Url::parse("https://idp.example.com").unwrap(),
            Url::parse(redirect).unwrap(),
            Url::parse("app://logout-done").unwrap(),
        )
    }

    pub fn discovery_body(server: &MockServer) -> serde_json::Value {
        serde_json::json!({
            "issuer": "https://idp.example.com",
            "authorization_endpoint": format!("{}/authorize", server.base_url()),
            "token_endpoint": format!("{}/token", server.base_url()),
            "end_session_endpoint": format!("{}/logout", server.base_url()),
        })
    }

    pub fn client_for(server: &MockServer, config: ProviderConfig) -> OidcClient {
        let discovery_url =
            Url::parse(&format!("{}/.well-known/openid-configuration", server.base_url())).unwrap();
        OidcClient::with_discovery_url(config, discovery_url).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn discovery_is_cached() {
        let server = MockServer::start();
        let discovery = server.mock(|when, then| {
            when.method(GET).path("/.well-known/openid-configuration");
            then.status(200).json_body(discovery_body(&server));
        });

        let client = client_for(&server, test_config("app://login"));
        let first = client.discover().await.unwrap();
        let second = client.discover().await.unwrap();
        discovery.assert_hits(1);
        assert_eq!(first.token_endpoint, second.token_endpoint);
        assert!(first.end_session_endpoint.is_some());
    }

    #[tokio::test]
    async fn exchange_code_success() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/.well-known/openid-configuration");
            then.status(200).json_body(discovery_body(&server));
        });
        let token = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .body_contains("grant_type=authorization_code")
                .body_contains("code_verifier");
            then.status(200).json_body(serde_json::json!({
                "access_token": "abc123",
                "refresh_token": "refresh456",
                "id_token": "h.p.s",
                "token_type": "bearer",
                "expires_in": 3600,
                "scope": "openid profile"
            }));
        });

        let client = client_for(&server, test_config("app://login"));
        let pkce = PkcePair::generate();
        let tokens = client.exchange_code("code123", &pkce).await.unwrap();
        token.assert();
        assert_eq!(tokens.access_token, "abc123");
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh456"));
        assert_eq!(tokens.id_token.as_deref(), Some("h.p.s"));
        assert_eq!(tokens.scope, vec!["openid", "profile"]);
        assert!(tokens.expires_at.is_some());
    }

    #[tokio::test]
    async fn refresh_rejection_is_oauth_class() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/.well-known/openid-configuration");
            then.status(200).json_body(discovery_body(&server));
        });
        server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(400).json_body(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "refresh token expired"
            }));
        });

        let client = client_for(&server, test_config("app://login"));
        let err = client.refresh("stale").await.unwrap_err();
        match err {
            OidcError::Oauth { error, description } => {
                assert_eq!(error, "invalid_grant");
                assert_eq!(description.as_deref(), Some("refresh token expired"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn five_xx_is_server_class() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/.well-known/openid-configuration");
            then.status(200).json_body(discovery_body(&server));
        });
        server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(502).body("bad gateway");
        });

        let client = client_for(&server, test_config("app://login"));
        let err = client.refresh("token").await.unwrap_err();
        assert!(err.is_server());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_network_class() {
        let config = test_config("app://login");
        // Port 1 refuses connections immediately.
        let client = OidcClient::with_discovery_url(
            config,
            Url::parse("http://127.0.0.1:1/.well-known/openid-configuration").unwrap(),
        )
        .unwrap();
        let err = client.refresh("token").await.unwrap_err();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn non_bearer_token_type_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/.well-known/openid-configuration");
            then.status(200).json_body(discovery_body(&server));
        });
        server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200).json_body(serde_json::json!({
                "access_token": "abc",
                "token_type": "mac",
            }));
        });

        let client = client_for(&server, test_config("app://login"));
        let err = client.refresh("token").await.unwrap_err();
        assert!(matches!(err, OidcError::InvalidTokenType(_)));
    }

    #[test]
    fn authorization_url_carries_extra_params() {
        let config = test_config("app://login");
        let client = OidcClient::new(config).unwrap();
        let metadata = ProviderMetadata {
            issuer: "https://idp.example.com".into(),
            authorization_endpoint: Url::parse("https://idp.example.com/authorize").unwrap(),
            token_endpoint: Url::parse("https://idp.example.com/token").unwrap(),
            end_session_endpoint: None,
        };
        let pkce = PkcePair::generate();
        let url = client.authorization_url(
            &metadata,
            &pkce,
            "state-1",
            &["profile".to_string()],
            &[("acr_values", "bankid internal".to_string())],
        );
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("scope".into(), "openid profile".into())));
        assert!(pairs.contains(&("acr_values".into(), "bankid internal".into())));
        assert!(pairs.contains(&("state".into(), "state-1".into())));
        assert!(pairs.contains(&("code_challenge_method".into(), "S256".into())));
    }

    #[test]
    fn end_session_url_requires_endpoint() {
        let config = test_config("app://login");
        let client = OidcClient::new(config).unwrap();
        let mut metadata = ProviderMetadata {
            issuer: "https://idp.example.com".into(),
            authorization_endpoint: Url::parse("https://idp.example.com/authorize").unwrap(),
            token_endpoint: Url::parse("https://idp.example.com/token").unwrap(),
            end_session_endpoint: None,
        };
        assert!(client.end_session_url(&metadata, "tok").is_none());

        metadata.end_session_endpoint = Some(Url::parse("https://idp.example.com/logout").unwrap());
        let url = client.end_session_url(&metadata, "tok").unwrap();
        assert!(url
            .query_pairs()
            .any(|(k, v)| k == "id_token_hint" && v == "tok"));
        assert!(url.query_pairs().any(|(k, _)| k == "post_logout_redirect_uri"));
    }
}
