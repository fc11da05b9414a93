use std::env;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::Duration;
use directories::ProjectDirs;
use thiserror::Error;
use url::Url;

/// Default tolerance applied when comparing token timestamps to local time.
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 120;

const ENV_PREFIX: &str = "KEYFLOW_";

/// Identity-provider and client configuration supplied by the host application.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub issuer: Url,
    /// Redirect URI the authorization response is delivered to.
    pub redirect_uri: Url,
    /// Redirect URI the end-session response is delivered to.
    pub post_logout_redirect_uri: Url,
    /// Intermediate resume URI used by two-phase external-app handoffs.
    pub secondary_resume_uri: Option<Url>,
    /// Namespace distinguishing persisted records when several apps share storage.
    pub storage_namespace: Option<String>,
    pub clock_skew: Duration,
    pub scopes: Vec<String>,
}

impl ProviderConfig {
    pub fn new<S: Into<String>>(
        client_id: S,
        issuer: Url,
        redirect_uri: Url,
        post_logout_redirect_uri: Url,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            issuer,
            redirect_uri,
            post_logout_redirect_uri,
            secondary_resume_uri: None,
            storage_namespace: None,
            clock_skew: Duration::seconds(DEFAULT_CLOCK_SKEW_SECS),
            scopes: vec!["openid".to_string()],
        }
    }

    pub fn with_secret<S: Into<String>>(mut self, secret: S) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn with_secondary_resume_uri(mut self, uri: Url) -> Self {
        self.secondary_resume_uri = Some(uri);
        self
    }

    pub fn with_storage_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.storage_namespace = Some(namespace.into());
        self
    }

    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Build a configuration from `KEYFLOW_*` environment variables.
    ///
    /// Required: `KEYFLOW_CLIENT_ID`, `KEYFLOW_ISSUER`, `KEYFLOW_REDIRECT_URI`,
    /// `KEYFLOW_LOGOUT_REDIRECT_URI`. Optional: `KEYFLOW_CLIENT_SECRET`,
    /// `KEYFLOW_SECONDARY_RESUME_URI`, `KEYFLOW_STORAGE_NAMESPACE`,
    /// `KEYFLOW_CLOCK_SKEW_SECS`, `KEYFLOW_SCOPES` (space-separated).
    pub fn from_env() -> Result<Self, ConfigError> {
        let client_id = require_var("CLIENT_ID")?;
        let issuer = require_url("ISSUER")?;
        let redirect_uri = require_url("REDIRECT_URI")?;
        let post_logout_redirect_uri = require_url("LOGOUT_REDIRECT_URI")?;

        let mut config = Self::new(client_id, issuer, redirect_uri, post_logout_redirect_uri);

        if let Some(secret) = optional_var("CLIENT_SECRET") {
            config.client_secret = Some(secret);
        }
        if let Some(raw) = optional_var("SECONDARY_RESUME_URI") {
            config.secondary_resume_uri = Some(parse_url("SECONDARY_RESUME_URI", &raw)?);
        }
        if let Some(namespace) = optional_var("STORAGE_NAMESPACE") {
            config.storage_namespace = Some(namespace);
        }
        if let Some(raw) = optional_var("CLOCK_SKEW_SECS") {
            let secs = raw
                .parse::<i64>()
                .map_err(|_| ConfigError::InvalidValue {
                    var: var_name("CLOCK_SKEW_SECS"),
                    value: raw,
                })?;
            config.clock_skew = Duration::seconds(secs);
        }
        if let Some(raw) = optional_var("SCOPES") {
            config.scopes = raw.split_whitespace().map(ToOwned::to_owned).collect();
        }

        Ok(config)
    }
}

fn var_name(suffix: &str) -> String {
    format!("{ENV_PREFIX}{suffix}")
}

fn optional_var(suffix: &str) -> Option<String> {
    env::var(var_name(suffix)).ok().filter(|v| !v.is_empty())
}

fn require_var(suffix: &str) -> Result<String, ConfigError> {
    optional_var(suffix).ok_or_else(|| ConfigError::MissingVar(var_name(suffix)))
}

fn require_url(suffix: &str) -> Result<Url, ConfigError> {
    let raw = require_var(suffix)?;
    parse_url(suffix, &raw)
}

fn parse_url(suffix: &str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|_| ConfigError::InvalidValue {
        var: var_name(suffix),
        value: raw.to_owned(),
    })
}

/// Resolves the on-disk location for persisted session records.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Discover the persistent configuration directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs =
            ProjectDirs::from("app", "keyflow", "keyflow").ok_or(ConfigError::MissingProjectDirs)?;
        let config_dir = dirs.config_dir();
        fs::create_dir_all(config_dir).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(config_dir)?;
        Ok(Self {
            root: config_dir.to_path_buf(),
        })
    }

    /// Path to the session record for the given storage namespace.
    pub fn session_file(&self, namespace: Option<&str>) -> PathBuf {
        let namespace = namespace.unwrap_or("default");
        self.root.join(format!("session-{namespace}.json"))
    }

    #[cfg(test)]
    pub(crate) fn from_root_for_tests(root: PathBuf) -> Self {
        Self { root }
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Errors that can occur while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingVar(String),
    #[error("environment variable {var} has invalid value '{value}'")]
    InvalidValue { var: String, value: String },
    #[error("unable to determine configuration directory for keyflow")]
    MissingProjectDirs,
    #[error("failed to create configuration directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn session_file_appends_namespace() {
        let temp_dir = TempDir::new().unwrap();
        let locator = ConfigLocator {
            root: temp_dir.path().to_path_buf(),
        };
        assert!(locator
            .session_file(Some("shared"))
            .ends_with("session-shared.json"));
        assert!(locator.session_file(None).ends_with("session-default.json"));
    }

    #[test]
    fn builder_defaults() {
        let config = ProviderConfig::new(
            "client",
            Url::parse("https://idp.example.com").unwrap(),
            Url::parse("app://login").unwrap(),
            Url::parse("app://logout").unwrap(),
        );
        assert_eq!(config.clock_skew, Duration::seconds(120));
        assert_eq!(config.scopes, vec!["openid"]);
        assert!(config.secondary_resume_uri.is_none());
    }
}
