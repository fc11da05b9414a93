use thiserror::Error;

use crate::oauth::OidcError;
use crate::redirect::FlowError;
use crate::validator::ValidationError;

/// Errors surfaced by session lifecycle operations.
///
/// Network-class refresh failures are recoverable: the last-known session is
/// retained in an offline state and observers see a connectivity transition
/// rather than a hard failure. OAuth and server rejections terminate the
/// session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("host application is missing required redirect wiring: {0}")]
    InvalidHostIntegration(String),
    #[error("failed to load provider configuration: {0}")]
    ConfigLoad(#[source] OidcError),
    #[error("token request failed: {0}")]
    TokenRequest(#[source] OidcError),
    #[error("ID token validation failed: {0}")]
    IdTokenValidation(#[source] ValidationError),
    #[error("no session")]
    NoSession,
    #[error("no session to refresh")]
    NoSessionToRefresh,
    #[error("refresh rejected by the authorization server: {0}")]
    RefreshOauth(String),
    #[error("refresh failed with a network error; session retained offline")]
    RefreshNetwork,
    #[error("refresh failed with a server error (status {0})")]
    RefreshServer(u16),
    #[error("discovery document has no end-session endpoint")]
    LogoutNoEndSessionUrl,
    #[error("logout page failed to load over the network")]
    LogoutNetwork,
    #[error("logout was rejected or could not be confirmed by the server")]
    LogoutServer,
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error("internal session state was inconsistent")]
    Unknown,
}
