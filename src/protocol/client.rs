use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::wire::{
    field, method, AuthReply, AuthRequest, GreetingReply, KeyUpdateReply, KeyUpdateRequest,
    RefreshSignal, RequestEnvelope,
};
use crate::config::ClientConfig;
use crate::crypto::cipher::public_key_bits;
use crate::crypto::{login_token, HashAlgorithm, KeyManager};
use crate::error::SecRestResult;
use crate::store::SessionStore;
use crate::transport::Transport;

/// How far the handshake with the server got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unestablished,
    /// We hold the server's public key and a session id
    KeyExchanged,
    Authenticated,
}

/// A decoded server reply
struct Reply {
    payload: Map<String, Value>,
    /// The reply was encrypted for our retiring key
    refresh_needed: bool,
}

/// Client half of the protocol
pub struct ClientProtocol {
    endpoint: String,
    login: String,
    password_hash: String,
    timestamp: String,
    keys: KeyManager,
    transport: Box<dyn Transport>,
    store: Arc<dyn SessionStore>,
    state: ClientState,
    session: Option<String>,
    server_key: Option<String>,
}

impl ClientProtocol {
    /// Establish a session with the configured endpoint.
    ///
    /// A session remembered by `store` is reused; otherwise the client greets
    /// the server first. Network trouble leaves the client unauthenticated
    /// instead of failing; only configuration and storage problems are errors.
    pub fn connect(
        config: &ClientConfig,
        transport: Box<dyn Transport>,
        store: Arc<dyn SessionStore>,
    ) -> SecRestResult<Self> {
        config.validate()?;
        let keys = KeyManager::new(&config.keys)?;

        let mut client = Self {
            endpoint: config.endpoint.clone(),
            login: config.login.clone(),
            password_hash: config.password_hash.clone(),
            timestamp: config.timestamp.clone(),
            keys,
            transport,
            store,
            state: ClientState::Unestablished,
            session: None,
            server_key: None,
        };

        // Prefer a session we already hold with this endpoint
        let remembered = match client.store.load_session(&client.endpoint)? {
            Some(binding) => {
                debug!(endpoint = %client.endpoint, session = %binding.session_id, "reusing remembered session");
                client.session = Some(binding.session_id);
                client.server_key = Some(binding.server_public_key);
                client.state = ClientState::KeyExchanged;
                true
            }
            None => false,
        };

        if !remembered {
            client.greet()?;
        }
        // A remembered server key may be two rotations old; greet once more
        if client.state == ClientState::KeyExchanged && !client.authenticate()? && remembered {
            info!(endpoint = %client.endpoint, "remembered session was refused, greeting again");
            if client.greet()? {
                client.authenticate()?;
            }
        }

        Ok(client)
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ClientState::Authenticated
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Server key our requests are encrypted for
    pub fn server_public_key(&self) -> Option<&str> {
        self.server_key.as_deref()
    }

    pub fn public_key(&self) -> Option<&str> {
        self.keys.public_key()
    }

    /// Retire our key pair now; the server learns the new key on the next exchange
    pub fn rotate_keys(&mut self) -> SecRestResult<()> {
        self.keys.rotate()
    }

    /// Send our public key and learn the server's key and a session id
    pub fn greet(&mut self) -> SecRestResult<bool> {
        let Some(public_key) = self.keys.public_key().map(str::to_string) else {
            warn!("client key material is unusable, cannot greet");
            return Ok(false);
        };

        let request = RequestEnvelope::new(method::GREETING)
            .with_free_field(field::CLIENT_PUBLIC_KEY, &public_key);
        let Some(reply) = self.exchange(&request) else {
            return Ok(false);
        };

        let greeting: GreetingReply = match serde_json::from_value(Value::Object(reply.payload)) {
            Ok(greeting) => greeting,
            Err(e) => {
                debug!(error = %e, "malformed greeting reply");
                return Ok(false);
            }
        };
        let (Some(server_key), Some(session_id)) = (greeting.server_public_key, greeting.session_id) else {
            warn!(endpoint = %self.endpoint, "server did not accept the greeting");
            return Ok(false);
        };

        self.store.save_session(&self.endpoint, &session_id, &server_key)?;
        info!(endpoint = %self.endpoint, session = %session_id, "exchanged keys with server");
        self.server_key = Some(server_key);
        self.session = Some(session_id);
        self.state = ClientState::KeyExchanged;
        Ok(true)
    }

    /// Prove our credentials; `Ok(false)` when the server refuses them
    pub fn authenticate(&mut self) -> SecRestResult<bool> {
        let Some(public_key) = self.keys.public_key().map(str::to_string) else {
            warn!("client key material is unusable, cannot authenticate");
            return Ok(false);
        };

        let body = AuthRequest {
            login: self.login.clone(),
            timestamp: self.timestamp.clone(),
            token: login_token(&self.password_hash, &self.timestamp),
            client_public_key: public_key,
        };
        let Some(datos) = self.encrypt_for_server(&body) else {
            warn!(endpoint = %self.endpoint, "could not encrypt credentials for the server key");
            return Ok(false);
        };

        let request = RequestEnvelope::new(method::AUTHENTICATE).with_data(&datos);
        let Some(mut reply) = self.exchange(&request) else {
            return Ok(false);
        };
        if let Some(signal) = RefreshSignal::take_from(&mut reply.payload) {
            self.apply_refresh(&signal)?;
        }
        let refresh_needed = reply.refresh_needed;

        let outcome: AuthReply = match serde_json::from_value(Value::Object(reply.payload)) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(error = %e, "malformed authentication reply");
                return Ok(false);
            }
        };
        let session_id = match (outcome.authenticated, outcome.session_id) {
            (true, Some(session_id)) => session_id,
            _ => {
                info!(login = %self.login, message = %outcome.message, "authentication refused");
                return Ok(false);
            }
        };

        if let Some(server_key) = &self.server_key {
            self.store.save_session(&self.endpoint, &session_id, server_key)?;
        }
        info!(login = %self.login, session = %session_id, "authenticated");
        self.session = Some(session_id);
        self.state = ClientState::Authenticated;

        if refresh_needed {
            self.reregister_key()?;
        }
        Ok(true)
    }

    /// Call `method` on the server.
    ///
    /// The reply payload is returned without any refresh pair; an empty map
    /// means the call could not be made (no authenticated session) or the
    /// reply could not be read.
    pub fn solicit(&mut self, method: &str, mut params: Map<String, Value>) -> SecRestResult<Map<String, Value>> {
        self.keys.refresh()?;

        let (ClientState::Authenticated, Some(session_id)) = (self.state, self.session.clone()) else {
            warn!(method, "not authenticated with the server, not sending");
            return Ok(Map::new());
        };
        params.insert(field::SESSION.to_string(), Value::String(session_id));

        let Some(datos) = self.encrypt_for_server(&params) else {
            warn!(method, "could not encrypt parameters for the server key");
            return Ok(Map::new());
        };
        let request = RequestEnvelope::new(method).with_data(&datos);
        let Some(mut reply) = self.exchange(&request) else {
            return Ok(Map::new());
        };

        if let Some(signal) = RefreshSignal::take_from(&mut reply.payload) {
            self.apply_refresh(&signal)?;
        }
        if reply.refresh_needed {
            self.reregister_key()?;
        }
        Ok(reply.payload)
    }

    /// Adopt a rotated server key once its signature checks out under the key on file
    pub fn apply_refresh(&mut self, signal: &RefreshSignal) -> SecRestResult<bool> {
        let Some(current) = self.server_key.as_deref() else {
            return Ok(false);
        };

        let bits = public_key_bits(current).unwrap_or(self.keys.key_bits());
        let algorithm = signal
            .hash_algorithm
            .as_deref()
            .map(HashAlgorithm::from_name_or_default)
            .unwrap_or_default();
        let check = KeyManager::verify(
            signal.public_key.as_bytes(),
            &signal.signature,
            current,
            bits,
            Some(algorithm),
        );
        if !check.valid {
            warn!(endpoint = %self.endpoint, "server key refresh carries a bad signature, ignoring it");
            return Ok(false);
        }

        if let Some(session_id) = &self.session {
            self.store.save_session(&self.endpoint, session_id, &signal.public_key)?;
        }
        info!(endpoint = %self.endpoint, "adopted the server's new public key");
        self.server_key = Some(signal.public_key.clone());
        Ok(true)
    }

    /// Send our current public key, signed with our retiring pair
    pub fn reregister_key(&mut self) -> SecRestResult<bool> {
        let (Some(session_id), Some(public_key)) =
            (self.session.clone(), self.keys.public_key().map(str::to_string))
        else {
            return Ok(false);
        };

        let signed = self.keys.sign(public_key.as_bytes(), false, true);
        let Some(signature) = signed.signature else {
            warn!("no retiring key pair to vouch for our new public key");
            return Ok(false);
        };

        let body = KeyUpdateRequest {
            session_id,
            client_public_key: public_key,
            signature,
            hash_algorithm: signed.hash_algorithm.map(|a| a.name().to_string()),
        };
        let Some(datos) = self.encrypt_for_server(&body) else {
            return Ok(false);
        };

        let request = RequestEnvelope::new(method::UPDATE_CLIENT_KEY).with_data(&datos);
        let Some(mut reply) = self.exchange(&request) else {
            return Ok(false);
        };
        if let Some(signal) = RefreshSignal::take_from(&mut reply.payload) {
            self.apply_refresh(&signal)?;
        }

        let updated = serde_json::from_value::<KeyUpdateReply>(Value::Object(reply.payload))
            .map(|r| r.updated)
            .unwrap_or(false);
        if updated {
            info!(endpoint = %self.endpoint, "server accepted our new public key");
        } else {
            warn!(endpoint = %self.endpoint, "server refused our new public key");
        }
        Ok(updated)
    }

    fn encrypt_for_server<T: Serialize>(&self, body: &T) -> Option<String> {
        let server_key = self.server_key.as_deref()?;
        let json = serde_json::to_string(body).ok()?;
        let bits = public_key_bits(server_key)?;
        KeyManager::encrypt(json.as_bytes(), server_key, bits)
    }

    fn exchange(&self, request: &RequestEnvelope) -> Option<Reply> {
        let url = request.to_url(&self.endpoint);
        match self.transport.fetch(&url) {
            Some(body) => self.open_reply(&body),
            None => {
                warn!(endpoint = %self.endpoint, method = ?request.method, "no reply from server");
                None
            }
        }
    }

    /// JSON bodies are read as is, anything else is decrypted first
    fn open_reply(&self, body: &str) -> Option<Reply> {
        let body = body.trim();
        if body.starts_with('{') {
            return serde_json::from_str(body).ok().map(|payload| Reply {
                payload,
                refresh_needed: false,
            });
        }

        let decrypted = self.keys.decrypt(body);
        let Some(text) = decrypted.text() else {
            debug!("server reply did not decrypt");
            return None;
        };
        serde_json::from_str(&text).ok().map(|payload| Reply {
            payload,
            refresh_needed: decrypted.refresh_needed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyManagerConfig;
    use crate::store::MemoryStore;
    use crate::transport::LoopbackTransport;
    use std::path::Path;

    fn config(dir: &Path) -> ClientConfig {
        let keys = KeyManagerConfig::new(dir, 300).with_key_bits(1024);
        ClientConfig::new("http://localhost/servicio", "user", "hash", "2024-05-01 12:00:00", keys)
    }

    #[test]
    fn test_unreachable_server_leaves_client_unestablished() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = LoopbackTransport::new(|_| None);
        let mut client =
            ClientProtocol::connect(&config(tmp.path()), Box::new(transport), Arc::new(MemoryStore::new())).unwrap();

        assert_eq!(client.state(), ClientState::Unestablished);
        assert!(client.session().is_none());
        assert!(client.solicit("ping", Map::new()).unwrap().is_empty());
    }

    #[test]
    fn test_greeting_without_key_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = LoopbackTransport::new(|_| Some(r#"{"pkey":null,"sesion":null}"#.to_string()));
        let client =
            ClientProtocol::connect(&config(tmp.path()), Box::new(transport), Arc::new(MemoryStore::new())).unwrap();

        assert_eq!(client.state(), ClientState::Unestablished);
        assert!(client.server_public_key().is_none());
    }

    #[test]
    fn test_garbage_reply_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = LoopbackTransport::new(|_| Some("definitely not ciphertext".to_string()));
        let client =
            ClientProtocol::connect(&config(tmp.path()), Box::new(transport), Arc::new(MemoryStore::new())).unwrap();

        assert!(!client.is_authenticated());
        assert!(client.open_reply("{\"a\":1}").is_some());
        assert!(client.open_reply("[1, 2]").is_none());
    }

    #[test]
    fn test_invalid_endpoint_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut bad = config(tmp.path());
        bad.endpoint = String::new();
        let transport = LoopbackTransport::new(|_| None);
        assert!(ClientProtocol::connect(&bad, Box::new(transport), Arc::new(MemoryStore::new())).is_err());
    }
}
