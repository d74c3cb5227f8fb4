use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::StoreLocator;
use crate::error::AuthError;

/// Keys the handshake is allowed to persist. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    CodeChallenge,
    State,
}

impl SessionKey {
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionKey::CodeChallenge => "oauth-code-challenge",
            SessionKey::State => "oauth-state",
        }
    }
}

/// Key-value persistence contract backed by the host's session storage.
///
/// Reads never fail: a missing key is `None`. Setting `None` removes the key.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: SessionKey) -> Option<String>;
    fn set(&self, key: SessionKey, value: Option<&str>);
}

/// Shared in-memory store.
///
/// Clones observe the same data, matching the origin-wide sharing of browser
/// session storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    inner: Arc<Mutex<HashMap<SessionKey, String>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: SessionKey) -> Option<String> {
        self.inner.lock().unwrap().get(&key).cloned()
    }

    fn set(&self, key: SessionKey, value: Option<&str>) {
        let mut values = self.inner.lock().unwrap();
        match value {
            Some(value) => {
                values.insert(key, value.to_owned());
            }
            None => {
                values.remove(&key);
            }
        }
    }
}

/// File-backed store for hosts without browser session storage.
///
/// I/O failures degrade to absent values with a warning rather than erroring,
/// preserving the adapter's no-error-conditions contract.
pub struct FileSessionStore {
    locator: StoreLocator,
}

impl FileSessionStore {
    pub fn new(locator: StoreLocator) -> Self {
        Self { locator }
    }

    pub fn with_default_locator() -> Result<Self, AuthError> {
        Ok(Self::new(StoreLocator::new()?))
    }

    fn read_document(&self) -> SessionDocument {
        let path = self.locator.session_file();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return SessionDocument::default()
            }
            Err(err) => {
                warn!(error = %err, "failed to read session file");
                return SessionDocument::default();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(error = %err, "malformed session file, starting over");
            SessionDocument::default()
        })
    }

    fn write_document(&self, document: &SessionDocument) -> Result<(), AuthError> {
        let path = self.locator.session_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(document)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(payload.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = file.metadata()?.permissions();
            permissions.set_mode(0o600);
            fs::set_permissions(&path, permissions)?;
        }

        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, key: SessionKey) -> Option<String> {
        self.read_document().values.get(key.as_str()).cloned()
    }

    fn set(&self, key: SessionKey, value: Option<&str>) {
        let mut document = self.read_document();
        match value {
            Some(value) => {
                document
                    .values
                    .insert(key.as_str().to_owned(), value.to_owned());
            }
            None => {
                document.values.remove(key.as_str());
            }
        }
        if let Err(err) = self.write_document(&document) {
            warn!(error = %err, "failed to persist session values");
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionDocument {
    version: u32,
    values: HashMap<String, String>,
}

impl Default for SessionDocument {
    fn default() -> Self {
        Self {
            version: 1,
            values: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn key_names_are_fixed() {
        assert_eq!(SessionKey::CodeChallenge.as_str(), "oauth-code-challenge");
        assert_eq!(SessionKey::State.as_str(), "oauth-state");
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemorySessionStore::new();
        assert_eq!(store.get(SessionKey::State), None);
        store.set(SessionKey::State, Some("nonce"));
        assert_eq!(store.get(SessionKey::State).as_deref(), Some("nonce"));
        store.set(SessionKey::State, None);
        assert_eq!(store.get(SessionKey::State), None);
    }

    #[test]
    fn memory_store_clones_share_data() {
        let store = MemorySessionStore::new();
        let clone = store.clone();
        store.set(SessionKey::CodeChallenge, Some("verifier"));
        assert_eq!(clone.get(SessionKey::CodeChallenge).as_deref(), Some("verifier"));
    }

    #[test]
    fn file_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let locator = StoreLocator::from_root_for_tests(temp_dir.path().to_path_buf());
        let store = FileSessionStore::new(locator);
        assert_eq!(store.get(SessionKey::CodeChallenge), None);
        store.set(SessionKey::CodeChallenge, Some("verifier"));
        store.set(SessionKey::State, Some("nonce"));
        assert_eq!(store.get(SessionKey::CodeChallenge).as_deref(), Some("verifier"));
        assert_eq!(store.get(SessionKey::State).as_deref(), Some("nonce"));
        store.set(SessionKey::State, None);
        assert_eq!(store.get(SessionKey::State), None);
    }

    #[test]
    fn file_store_survives_malformed_document() {
        let temp_dir = TempDir::new().unwrap();
        let locator = StoreLocator::from_root_for_tests(temp_dir.path().to_path_buf());
        fs::write(locator.session_file(), "not json").unwrap();
        let store = FileSessionStore::new(locator);
        assert_eq!(store.get(SessionKey::State), None);
        store.set(SessionKey::State, Some("nonce"));
        assert_eq!(store.get(SessionKey::State).as_deref(), Some("nonce"));
    }
}
