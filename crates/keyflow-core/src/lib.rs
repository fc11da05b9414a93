//! Core library managing an OAuth2/OIDC session for a native client
//! application: browser-delegated login, persistence, refresh, connectivity
//! reconciliation, and logout.
//!
//! The [`manager::SessionManager`] is the sole owner of session state; the
//! browser surface, persistence backend, and reachability sensing are
//! collaborators plugged in behind traits.

pub mod browser;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod oauth;
pub mod pkce;
pub mod reachability;
pub mod redirect;
pub mod session;
pub mod store;
pub mod validator;

pub use browser::{BrowserPresenter, PresentError, SystemBrowser};
pub use config::{ConfigError, ConfigLocator, ProviderConfig};
pub use error::SessionError;
pub use events::{ObserverRegistry, SessionObserver};
pub use manager::{LoginOptions, LoginProgress, Prompt, SessionManager};
pub use oauth::{OidcClient, OidcError, ProviderMetadata, TokenSet};
pub use redirect::{AuthorizationResponse, FlowError, LogoutOutcome};
pub use session::{Session, SessionStatus};
pub use store::{FileSessionStore, SessionStore, StoreError};
pub use validator::{IdTokenClaims, TokenValidator, ValidationError};
