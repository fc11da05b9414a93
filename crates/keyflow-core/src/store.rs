use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, ConfigLocator};
use crate::session::Session;

/// Errors raised by session persistence backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persistence abstraction for the single active session record.
///
/// Implementations must protect the record at rest; the file-backed store
/// below restricts permissions to the owning user, and platform keychain
/// adapters plug in behind this same trait.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<Session>, StoreError>;
    /// Persist the given session; `None` clears the record.
    fn save(&self, session: Option<&Session>) -> Result<(), StoreError>;
    fn delete(&self) -> Result<(), StoreError>;
}

/// Filesystem-backed session storage under the user configuration directory.
pub struct FileSessionStore {
    locator: ConfigLocator,
    namespace: Option<String>,
}

impl FileSessionStore {
    pub fn new(locator: ConfigLocator, namespace: Option<String>) -> Self {
        Self { locator, namespace }
    }

    pub fn with_default_locator(namespace: Option<String>) -> Result<Self, StoreError> {
        Ok(Self::new(ConfigLocator::new()?, namespace))
    }

    fn path(&self) -> std::path::PathBuf {
        self.locator.session_file(self.namespace.as_deref())
    }

    fn write_file(path: &Path, payload: &str) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(payload.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perm = file.metadata()?.permissions();
            perm.set_mode(0o600);
            fs::set_permissions(path, perm)?;
        }

        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<Session>, StoreError> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let envelope: SessionEnvelope = serde_json::from_str(&raw)?;
        Ok(Some(envelope.session))
    }

    fn save(&self, session: Option<&Session>) -> Result<(), StoreError> {
        let Some(session) = session else {
            return self.delete();
        };
        let envelope = SessionEnvelope {
            version: 1,
            session: session.clone(),
        };
        let payload = serde_json::to_string_pretty(&envelope)?;
        Self::write_file(&self.path(), &payload)
    }

    fn delete(&self) -> Result<(), StoreError> {
        match fs::remove_file(self.path()) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionEnvelope {
    version: u32,
    session: Session,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::make_session;
    use chrono::Duration;
    use tempfile::TempDir;

    fn store(temp_dir: &TempDir) -> FileSessionStore {
        let locator = ConfigLocator::from_root_for_tests(temp_dir.path().to_path_buf());
        FileSessionStore::new(locator, None)
    }

    #[test]
    fn round_trip_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        let session = make_session(Duration::minutes(5));
        store.save(Some(&session)).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.access_token, session.access_token);
        assert_eq!(loaded.refresh_token, session.refresh_token);
        assert!(loaded.claims.is_some());
    }

    #[test]
    fn save_none_clears_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.save(Some(&make_session(Duration::minutes(5)))).unwrap();
        store.save(None).unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn delete_missing_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.delete().unwrap();
        store.delete().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn record_is_user_readable_only() {
        use std::os::unix::fs::PermissionsExt;
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.save(Some(&make_session(Duration::minutes(5)))).unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn namespaced_records_do_not_collide() {
        let temp_dir = TempDir::new().unwrap();
        let locator = ConfigLocator::from_root_for_tests(temp_dir.path().to_path_buf());
        let a = FileSessionStore::new(locator.clone(), Some("a".into()));
        let b = FileSessionStore::new(locator, Some("b".into()));
        a.save(Some(&make_session(Duration::minutes(5)))).unwrap();
        assert!(b.load().unwrap().is_none());
    }
}
