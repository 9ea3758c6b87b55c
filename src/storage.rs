//! Session token storage using the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate), on
//! macOS Keychain, and on Linux the Secret Service API. The token is held in
//! memory for the life of the process and only written back on sign-in or
//! eviction.

use keyring::Entry;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::auth::{identity_from_token, UserIdentity};

const SERVICE_NAME: &str = "garcom-pos";

// Credential keys
const KEY_SESSION_TOKEN: &str = "session_token";

// ---------------------------------------------------------------------------
// Credential backends
// ---------------------------------------------------------------------------

/// Where the session token is persisted between runs.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn delete(&self, key: &str) -> Result<(), String>;
}

/// OS keyring backend.
pub struct KeyringStore;

impl CredentialStore for KeyringStore {
    /// Returns `None` when the entry does not exist (or the platform returns
    /// a "not found" error).
    fn get(&self, key: &str) -> Option<String> {
        let entry = match Entry::new(SERVICE_NAME, key) {
            Ok(e) => e,
            Err(e) => {
                warn!(key, error = %e, "keyring: failed to create entry");
                return None;
            }
        };
        match entry.get_password() {
            Ok(pw) => Some(pw),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(key, error = %e, "keyring: failed to read credential");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
        entry.set_password(value).map_err(|e| e.to_string())
    }

    /// Silently succeeds if the entry does not exist.
    fn delete(&self, key: &str) -> Result<(), String> {
        let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Process-local backend for tests and headless runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.entries
            .lock()
            .map_err(|_| "credential store poisoned".to_string())?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), String> {
        self.entries
            .lock()
            .map_err(|_| "credential store poisoned".to_string())?
            .remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Signed-in session: bearer token plus the identity decoded from it.
pub struct Session {
    store: Arc<dyn CredentialStore>,
    token: RwLock<Option<Zeroizing<String>>>,
}

impl Session {
    /// Load whatever token the credential store already holds.
    pub fn load(store: Arc<dyn CredentialStore>) -> Self {
        let token = store
            .get(KEY_SESSION_TOKEN)
            .filter(|t| !t.trim().is_empty())
            .map(Zeroizing::new);
        if token.is_some() {
            info!("Restored stored session token");
        }
        Self {
            store,
            token: RwLock::new(token),
        }
    }

    /// In-memory session seeded with `token`. Nothing touches the OS keyring.
    pub fn ephemeral(token: Option<&str>) -> Self {
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryStore::default());
        if let Some(t) = token {
            let _ = store.set(KEY_SESSION_TOKEN, t);
        }
        Self::load(store)
    }

    pub fn token(&self) -> Option<Zeroizing<String>> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    pub fn identity(&self) -> Option<UserIdentity> {
        self.token().and_then(|t| identity_from_token(&t))
    }

    pub fn set_token(&self, token: &str) -> Result<(), String> {
        self.store.set(KEY_SESSION_TOKEN, token)?;
        if let Ok(mut slot) = self.token.write() {
            *slot = Some(Zeroizing::new(token.to_string()));
        }
        Ok(())
    }

    /// Forget the token in memory and in the credential store.
    pub fn evict(&self) {
        if let Ok(mut slot) = self.token.write() {
            *slot = None;
        }
        if let Err(e) = self.store.delete(KEY_SESSION_TOKEN) {
            warn!(error = %e, "Failed to delete stored session token");
        }
        info!("Session evicted");
    }
}
