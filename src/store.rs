//! Collaborator interfaces for session and credential persistence
//!
//! The protocol never decides where sessions live; it is handed an
//! implementation of these traits. [`MemoryStore`] keeps everything in
//! process and [`crate::sessiondb::SessionDb`] keeps it in SQLite.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::error::{SecRestError, SecRestResult};

/// A session a client holds with one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub session_id: String,
    pub server_public_key: String,
}

/// Client side: remembers the session and server key per endpoint
pub trait SessionStore {
    /// Latest session established with `url`, if any
    fn load_session(&self, url: &str) -> SecRestResult<Option<SessionBinding>>;

    fn save_session(&self, url: &str, session_id: &str, server_public_key: &str) -> SecRestResult<()>;
}

/// Server side: binds session ids to client public keys
pub trait SessionKeyStore {
    fn save_session_public_key(&self, session_id: &str, public_key: &str) -> SecRestResult<()>;

    fn load_session_public_key(&self, session_id: &str) -> SecRestResult<Option<String>>;
}

/// Server side: sha512 password hashes by login
pub trait CredentialStore {
    fn lookup_credential_hash(&self, login: &str) -> SecRestResult<Option<String>>;
}

/// Everything a server needs from storage
pub trait ServerStore: SessionKeyStore + CredentialStore {}

impl<T: SessionKeyStore + CredentialStore + ?Sized> ServerStore for T {}

/// In-process store, mostly for tests and demos
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, SessionBinding>>,
    session_keys: Mutex<HashMap<String, String>>,
    credentials: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `login` with the hex sha512 of its password
    pub fn with_credential(mut self, login: &str, password_hash: &str) -> Self {
        // We own the store, so a poisoned map is still ours to write
        self.credentials
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(login.to_string(), password_hash.to_string());
        self
    }

    pub fn set_credential(&self, login: &str, password_hash: &str) -> SecRestResult<()> {
        self.credentials
            .lock()
            .map_err(poisoned)?
            .insert(login.to_string(), password_hash.to_string());
        Ok(())
    }
}

fn poisoned<T>(_: T) -> SecRestError {
    SecRestError::StoreError("memory store lock poisoned".to_string())
}

impl SessionStore for MemoryStore {
    fn load_session(&self, url: &str) -> SecRestResult<Option<SessionBinding>> {
        Ok(self.sessions.lock().map_err(poisoned)?.get(url).cloned())
    }

    fn save_session(&self, url: &str, session_id: &str, server_public_key: &str) -> SecRestResult<()> {
        self.sessions.lock().map_err(poisoned)?.insert(
            url.to_string(),
            SessionBinding {
                session_id: session_id.to_string(),
                server_public_key: server_public_key.to_string(),
            },
        );
        Ok(())
    }
}

impl SessionKeyStore for MemoryStore {
    fn save_session_public_key(&self, session_id: &str, public_key: &str) -> SecRestResult<()> {
        self.session_keys
            .lock()
            .map_err(poisoned)?
            .insert(session_id.to_string(), public_key.to_string());
        Ok(())
    }

    fn load_session_public_key(&self, session_id: &str) -> SecRestResult<Option<String>> {
        Ok(self.session_keys.lock().map_err(poisoned)?.get(session_id).cloned())
    }
}

impl CredentialStore for MemoryStore {
    fn lookup_credential_hash(&self, login: &str) -> SecRestResult<Option<String>> {
        Ok(self.credentials.lock().map_err(poisoned)?.get(login).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_session_wins() -> SecRestResult<()> {
        let store = MemoryStore::new();
        assert!(store.load_session("http://svc")?.is_none());

        store.save_session("http://svc", "aaaaaaaaaaaaa", "key-1")?;
        store.save_session("http://svc", "bbbbbbbbbbbbb", "key-2")?;

        let binding = store.load_session("http://svc")?.unwrap();
        assert_eq!(binding.session_id, "bbbbbbbbbbbbb");
        assert_eq!(binding.server_public_key, "key-2");
        Ok(())
    }

    #[test]
    fn test_credentials_and_session_keys() -> SecRestResult<()> {
        let store = MemoryStore::new().with_credential("user", "hash");
        assert_eq!(store.lookup_credential_hash("user")?, Some("hash".to_string()));
        assert_eq!(store.lookup_credential_hash("nobody")?, None);

        store.save_session_public_key("sid", "pem")?;
        assert_eq!(store.load_session_public_key("sid")?, Some("pem".to_string()));
        Ok(())
    }

    #[test]
    fn test_poisoned_store_reports_error() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let clone = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.credentials.lock().unwrap();
            panic!("poison the credential map");
        })
        .join();

        assert!(matches!(
            store.set_credential("user", "hash"),
            Err(SecRestError::StoreError(_))
        ));
        assert!(store.lookup_credential_hash("user").is_err());
    }
}
