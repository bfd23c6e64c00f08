use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::wire::{
    self, field, method, reply_text, AuthReply, GreetingReply, KeyUpdateReply, RefreshSignal,
    RequestEnvelope,
};
use crate::config::ServerConfig;
use crate::crypto::cipher::{parse_public_key, public_key_bits};
use crate::crypto::{login_token, HashAlgorithm, KeyManager};
use crate::error::{SecRestError, SecRestResult};
use crate::store::ServerStore;

/// Request fields after decryption, `datos` merged flat
pub type Request = Map<String, Value>;

/// Methods every server answers, whatever its whitelist says
pub const BUILTIN_METHODS: [&str; 3] = [
    method::GREETING,
    method::AUTHENTICATE,
    method::UPDATE_CLIENT_KEY,
];

/// Timestamp layouts accepted in addition to RFC 3339; read as UTC
const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// JSON object returned by a handler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    fields: Map<String, Value>,
}

impl HandlerOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output carrying the conventional `id_error: 0` and empty `error`
    pub fn ok() -> Self {
        Self::new().with(field::ERROR_ID, 0).with(field::ERROR, "")
    }

    /// Output reporting a handler level failure
    pub fn error(id: i64, description: &str) -> Self {
        Self::new().with(field::ERROR_ID, id).with(field::ERROR, description)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.fields
    }

    fn from_serializable<T: Serialize>(value: &T) -> SecRestResult<Self> {
        match serde_json::to_value(value)? {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(SecRestError::InvalidMessage(format!(
                "handler output must be a JSON object, got {}",
                other
            ))),
        }
    }
}

impl From<Map<String, Value>> for HandlerOutput {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

type Handler = Rc<dyn Fn(&Request) -> HandlerOutput>;

#[derive(Clone)]
enum Route {
    Greeting,
    Authenticate,
    UpdateClientKey,
    Custom(Handler),
}

/// Server half of the protocol.
///
/// One instance answers one request: it is built with the caller's session
/// id (if any), handed the request, and dropped.
pub struct ServerProtocol {
    keys: KeyManager,
    store: Arc<dyn ServerStore>,
    timeout: i64,
    routes: HashMap<String, Route>,
    whitelist: HashSet<String>,
    session: Option<String>,
    client_key: Option<String>,
    clock: Box<dyn Fn() -> DateTime<Utc>>,
}

impl ServerProtocol {
    /// Open the server's keys and resume `session` if it is bound to a client key
    pub fn new(
        config: &ServerConfig,
        store: Arc<dyn ServerStore>,
        session: Option<&str>,
    ) -> SecRestResult<Self> {
        config.validate()?;
        let keys = KeyManager::new(&config.keys)?;
        Self::with_keys(keys, config.timeout, store, session)
    }

    pub fn with_keys(
        keys: KeyManager,
        timeout: i64,
        store: Arc<dyn ServerStore>,
        session: Option<&str>,
    ) -> SecRestResult<Self> {
        if !keys.is_valid() {
            warn!("server key material is unusable, requests cannot be decrypted");
        }

        let routes = HashMap::from([
            (method::GREETING.to_string(), Route::Greeting),
            (method::AUTHENTICATE.to_string(), Route::Authenticate),
            (method::UPDATE_CLIENT_KEY.to_string(), Route::UpdateClientKey),
        ]);

        let mut server = Self {
            keys,
            store,
            timeout,
            routes,
            whitelist: BUILTIN_METHODS.iter().map(|m| m.to_string()).collect(),
            session: None,
            client_key: None,
            clock: Box::new(Utc::now),
        };

        if let Some(id) = session.filter(|id| wire::is_session_id(id)) {
            server.resolve_session(id)?;
        }
        Ok(server)
    }

    /// Replace the wall clock used to age login timestamps
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + 'static,
    {
        self.clock = Box::new(clock);
        self
    }

    /// Make `handler` available under `name`; it only runs once whitelisted
    pub fn register<F>(&mut self, name: &str, handler: F) -> SecRestResult<()>
    where
        F: Fn(&Request) -> HandlerOutput + 'static,
    {
        if BUILTIN_METHODS.contains(&name) {
            return Err(SecRestError::ConfigError(format!(
                "{} is a built-in method and cannot be replaced",
                name
            )));
        }
        self.routes.insert(name.to_string(), Route::Custom(Rc::new(handler)));
        Ok(())
    }

    /// Restrict dispatch to `methods` plus the built-ins.
    ///
    /// Every name must have a handler; otherwise nothing changes and the
    /// missing names are reported.
    pub fn establish_whitelist(&mut self, methods: &[&str]) -> SecRestResult<()> {
        let unknown: Vec<&str> = methods
            .iter()
            .copied()
            .filter(|name| !self.routes.contains_key(*name))
            .collect();
        if !unknown.is_empty() {
            return Err(SecRestError::UnknownMethod(unknown.join(", ")));
        }

        self.whitelist = BUILTIN_METHODS
            .iter()
            .map(|m| m.to_string())
            .chain(methods.iter().map(|m| m.to_string()))
            .collect();
        debug!(methods = ?methods, "whitelist established");
        Ok(())
    }

    pub fn is_whitelisted(&self, name: &str) -> bool {
        self.whitelist.contains(name)
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Key the reply will be encrypted for
    pub fn client_public_key(&self) -> Option<&str> {
        self.client_key.as_deref()
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    /// Parse a raw query string and answer it
    pub fn handle_query(&mut self, query: &str) -> SecRestResult<String> {
        self.handle(&RequestEnvelope::from_query(query))
    }

    /// Answer one request with a JSON body, encrypted when the client key is known.
    ///
    /// Only storage failures are errors; everything else is reported in the body.
    pub fn handle(&mut self, request: &RequestEnvelope) -> SecRestResult<String> {
        // Decrypt everything outside the free set into one flat map
        let mut working = Request::new();
        let mut refresh = None;
        if !request.is_empty() {
            refresh = self.secure_request(request, &mut working);
        }

        // The session id may only be readable once `datos` is decrypted
        if self.client_key.is_none() {
            let claimed = working
                .get(field::SESSION)
                .and_then(Value::as_str)
                .filter(|id| wire::is_session_id(id))
                .map(str::to_string);
            if let Some(id) = claimed {
                self.resolve_session(&id)?;
            }
        }

        let name = request.method.as_deref().unwrap_or(method::GREETING);
        let mut output = match self.route_for(name) {
            Some(route) => {
                debug!(method = name, session = ?self.session, "dispatching");
                self.dispatch(route, &working)?
            }
            None => {
                info!(method = name, "method not whitelisted, ignoring request");
                HandlerOutput::new().with(field::MESSAGE, reply_text::unknown_method(name))
            }
        };

        // Late traffic: tell the client about our new key
        if let Some(signal) = refresh {
            signal.merge_into(&mut output.fields);
        }
        self.seal_reply(output)
    }

    fn resolve_session(&mut self, id: &str) -> SecRestResult<()> {
        if let Some(key) = self.store.load_session_public_key(id)? {
            debug!(session = id, "resumed session");
            self.session = Some(id.to_string());
            self.client_key = Some(key);
        }
        Ok(())
    }

    fn route_for(&self, name: &str) -> Option<Route> {
        if !self.whitelist.contains(name) {
            return None;
        }
        self.routes.get(name).cloned()
    }

    fn dispatch(&mut self, route: Route, request: &Request) -> SecRestResult<HandlerOutput> {
        match route {
            Route::Greeting => self.greeting(request),
            Route::Authenticate => self.authenticate(request),
            Route::UpdateClientKey => self.update_client_key(request),
            Route::Custom(handler) => Ok(handler(request)),
        }
    }

    /// Decrypt every non-free field into `working`; returns a refresh pair
    /// when the client encrypted for our retiring key.
    fn secure_request(&self, request: &RequestEnvelope, working: &mut Request) -> Option<RefreshSignal> {
        let mut refresh = None;

        if let Some(name) = &request.method {
            working.insert(field::METHOD.to_string(), Value::String(name.clone()));
        }
        for (name, value) in &request.free_fields {
            working.insert(name.clone(), Value::String(value.clone()));
        }

        for (name, value) in &request.encrypted_fields {
            let decrypted = self.keys.decrypt(value);
            if decrypted.refresh_needed && refresh.is_none() {
                refresh = self.refresh_signal();
            }

            let Some(text) = decrypted.text() else {
                debug!(field = %name, "field did not decrypt, dropping it");
                continue;
            };

            if name == field::DATA {
                match serde_json::from_str::<Request>(&text) {
                    Ok(data) => working.extend(data),
                    Err(_) => debug!("datos is not a JSON object, dropping it"),
                }
            } else if !text.is_empty() {
                working.insert(name.clone(), Value::String(text));
            }
        }

        refresh
    }

    fn refresh_signal(&self) -> Option<RefreshSignal> {
        let public_key = self.keys.public_key()?.to_string();
        let signed = self.keys.sign(public_key.as_bytes(), false, true);
        info!("client used our retiring key, attaching refresh pair");
        Some(RefreshSignal {
            public_key,
            signature: signed.signature?,
            hash_algorithm: signed.hash_algorithm.map(|a| a.name().to_string()),
        })
    }

    fn seal_reply(&self, output: HandlerOutput) -> SecRestResult<String> {
        let body = serde_json::to_string(&Value::Object(output.into_map()))?;
        let Some(client_key) = &self.client_key else {
            return Ok(body);
        };

        let bits = public_key_bits(client_key).unwrap_or(self.keys.key_bits());
        match KeyManager::encrypt(body.as_bytes(), client_key, bits) {
            Some(ciphertext) => Ok(ciphertext),
            None => {
                warn!(session = ?self.session, "could not encrypt reply for the client key");
                let fallback = HandlerOutput::error(-1, reply_text::REPLY_NOT_ENCRYPTED);
                Ok(serde_json::to_string(&Value::Object(fallback.into_map()))?)
            }
        }
    }

    fn greeting(&mut self, request: &Request) -> SecRestResult<HandlerOutput> {
        // The greeting reply always goes out in plaintext.
        self.client_key = None;

        let supplied = str_field(request, field::CLIENT_PUBLIC_KEY)
            .filter(|key| parse_public_key(key).is_ok());
        let server_key = self.keys.public_key().map(str::to_string);

        let reply = match (supplied, server_key) {
            (Some(client_key), Some(server_key)) => {
                let session_id = wire::mint_session_id();
                self.store.save_session_public_key(&session_id, client_key)?;
                info!(session = %session_id, "greeted new client");
                self.session = Some(session_id.clone());
                GreetingReply {
                    server_public_key: Some(server_key),
                    session_id: Some(session_id),
                }
            }
            _ => GreetingReply {
                server_public_key: None,
                session_id: None,
            },
        };
        HandlerOutput::from_serializable(&reply)
    }

    fn authenticate(&mut self, request: &Request) -> SecRestResult<HandlerOutput> {
        self.client_key = None;

        let login = str_field(request, field::LOGIN);
        let timestamp = str_field(request, field::TIMESTAMP);
        let token = str_field(request, field::TOKEN);
        let client_key = str_field(request, field::CLIENT_KEY).filter(|key| parse_public_key(key).is_ok());

        let now = (self.clock)();
        let elapsed = timestamp
            .and_then(parse_timestamp)
            .map(|sent| (now - sent).num_seconds().abs());

        let stored_hash = match login {
            Some(login) => self.store.lookup_credential_hash(login)?,
            None => None,
        };
        let token_matches = match (stored_hash, timestamp, token) {
            (Some(hash), Some(timestamp), Some(token)) => login_token(&hash, timestamp) == token,
            _ => false,
        };

        let reply = match (elapsed, client_key) {
            (Some(elapsed), _) if elapsed >= self.timeout => {
                info!(login = ?login, elapsed, timeout = self.timeout, "login timestamp too old");
                AuthReply::rejected(reply_text::AUTH_EXPIRED)
            }
            (Some(_), Some(client_key)) if token_matches => {
                let session_id = wire::mint_session_id();
                self.store.save_session_public_key(&session_id, client_key)?;
                info!(login = ?login, session = %session_id, "client authenticated");
                self.session = Some(session_id.clone());
                self.client_key = Some(client_key.to_string());
                AuthReply {
                    authenticated: true,
                    message: reply_text::AUTH_OK.to_string(),
                    session_id: Some(session_id),
                    client_public_key: Some(client_key.to_string()),
                }
            }
            _ => {
                info!(login = ?login, "authentication failed");
                AuthReply::rejected(reply_text::AUTH_FAILED)
            }
        };
        HandlerOutput::from_serializable(&reply)
    }

    fn update_client_key(&mut self, request: &Request) -> SecRestResult<HandlerOutput> {
        let session_id = str_field(request, field::SESSION).filter(|id| wire::is_session_id(id));
        let new_key = str_field(request, field::CLIENT_KEY).filter(|key| parse_public_key(key).is_ok());
        let signature = str_field(request, field::CLIENT_KEY_SIGNATURE);
        let algorithm = HashAlgorithm::from_name_or_default(str_field(request, field::DIGEST).unwrap_or(""));

        let rejected = |message: &str| {
            HandlerOutput::from_serializable(&KeyUpdateReply {
                updated: false,
                message: message.to_string(),
            })
        };

        let (Some(session_id), Some(new_key), Some(signature)) = (session_id, new_key, signature) else {
            return rejected(reply_text::KEY_REJECTED);
        };
        let Some(bound_key) = self.store.load_session_public_key(session_id)? else {
            return rejected(reply_text::SESSION_UNKNOWN);
        };

        let bits = public_key_bits(&bound_key).unwrap_or(self.keys.key_bits());
        let check = KeyManager::verify(new_key.as_bytes(), signature, &bound_key, bits, Some(algorithm));
        if !check.valid {
            warn!(session = session_id, "client key update carries a bad signature");
            return rejected(reply_text::KEY_REJECTED);
        }

        self.store.save_session_public_key(session_id, new_key)?;
        info!(session = session_id, "client public key replaced");
        self.session = Some(session_id.to_string());
        self.client_key = Some(new_key.to_string());

        HandlerOutput::from_serializable(&KeyUpdateReply {
            updated: true,
            message: reply_text::KEY_UPDATED.to_string(),
        })
    }
}

fn str_field<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.get(name).and_then(Value::as_str)
}

/// Parse a client timestamp; `None` means the age cannot be computed
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyManagerConfig;
    use crate::store::{MemoryStore, SessionKeyStore};
    use crate::protocol::wire::AuthRequest;
    use std::cell::Cell;
    use std::path::Path;
    use tempfile::TempDir;

    const PASSWORD_HASH: &str = "a1b2c3";

    fn keys_config(dir: &Path) -> KeyManagerConfig {
        KeyManagerConfig::new(dir, 300).with_key_bits(1024)
    }

    struct Fixture {
        _server_dir: TempDir,
        _client_dir: TempDir,
        config: ServerConfig,
        store: Arc<MemoryStore>,
        client: KeyManager,
    }

    impl Fixture {
        fn new() -> Self {
            let server_dir = tempfile::tempdir().unwrap();
            let client_dir = tempfile::tempdir().unwrap();
            let config = ServerConfig::new(keys_config(server_dir.path()));
            let client = KeyManager::new(&keys_config(client_dir.path())).unwrap();
            Self {
                _server_dir: server_dir,
                _client_dir: client_dir,
                config,
                store: Arc::new(MemoryStore::new().with_credential("user", PASSWORD_HASH)),
                client,
            }
        }

        fn server(&self) -> ServerProtocol {
            ServerProtocol::new(&self.config, self.store.clone(), None).unwrap()
        }

        fn client_key(&self) -> &str {
            self.client.public_key().unwrap()
        }

        fn encrypt_for(&self, server: &ServerProtocol, body: &str) -> String {
            KeyManager::encrypt(body.as_bytes(), server.keys().public_key().unwrap(), 1024).unwrap()
        }

        fn auth_request(&self, server: &ServerProtocol, timestamp: &str, password_hash: &str) -> RequestEnvelope {
            let body = AuthRequest {
                login: "user".to_string(),
                timestamp: timestamp.to_string(),
                token: login_token(password_hash, timestamp),
                client_public_key: self.client_key().to_string(),
            };
            let datos = self.encrypt_for(server, &serde_json::to_string(&body).unwrap());
            RequestEnvelope::new(method::AUTHENTICATE).with_data(&datos)
        }

        fn open(&self, reply: &str) -> Value {
            let text = self.client.decrypt(reply).text().unwrap();
            serde_json::from_str(&text).unwrap()
        }
    }

    fn plain(reply: &str) -> Value {
        serde_json::from_str(reply).unwrap()
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn seconds_before_now(seconds: i64) -> String {
        (fixed_now() - chrono::Duration::seconds(seconds))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }

    #[test]
    fn test_whitelist_rejects_unknown_methods() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        server.register("ping", |_| HandlerOutput::ok()).unwrap();

        let err = server.establish_whitelist(&["ping", "nope"]).unwrap_err();
        assert!(matches!(err, SecRestError::UnknownMethod(ref names) if names == "nope"));
        assert!(!server.is_whitelisted("ping"));

        server.establish_whitelist(&["ping"]).unwrap();
        assert!(server.is_whitelisted("ping"));
        assert!(server.is_whitelisted(method::GREETING));
        assert!(server.is_whitelisted(method::AUTHENTICATE));
    }

    #[test]
    fn test_builtin_methods_cannot_be_replaced() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        assert!(server.register(method::GREETING, |_| HandlerOutput::new()).is_err());
    }

    #[test]
    fn test_non_whitelisted_method_is_a_noop() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        let called = Rc::new(Cell::new(false));
        let flag = called.clone();
        server
            .register("secret", move |_| {
                flag.set(true);
                HandlerOutput::ok()
            })
            .unwrap();

        let reply = server.handle(&RequestEnvelope::new("secret")).unwrap();
        assert_eq!(
            plain(&reply),
            serde_json::json!({"mensaje": "Funcionalidad no existente [secret]"})
        );
        assert!(!called.get());
    }

    #[test]
    fn test_greeting_registers_client_key() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        let request = RequestEnvelope::new(method::GREETING)
            .with_free_field(field::CLIENT_PUBLIC_KEY, fixture.client_key());

        let reply: GreetingReply = serde_json::from_str(&server.handle(&request).unwrap()).unwrap();
        let session_id = reply.session_id.unwrap();

        assert!(wire::is_session_id(&session_id));
        assert_eq!(reply.server_public_key.as_deref(), server.keys().public_key());
        assert_eq!(
            fixture.store.load_session_public_key(&session_id).unwrap().as_deref(),
            Some(fixture.client_key())
        );
    }

    #[test]
    fn test_empty_request_greets_without_key() {
        let fixture = Fixture::new();
        let mut server = fixture.server();
        let reply = server.handle(&RequestEnvelope::default()).unwrap();
        assert_eq!(plain(&reply), serde_json::json!({"pkey": null, "sesion": null}));
    }

    #[test]
    fn test_authentication_timeout_boundary_is_rejected() {
        let fixture = Fixture::new();
        let mut server = fixture.server().with_clock(fixed_now);

        let request = fixture.auth_request(&server, &seconds_before_now(300), PASSWORD_HASH);
        let reply = plain(&server.handle(&request).unwrap());
        assert_eq!(reply[field::AUTHENTICATED], false);
        assert_eq!(reply[field::MESSAGE], reply_text::AUTH_EXPIRED);
        assert!(server.client_public_key().is_none());
    }

    #[test]
    fn test_authentication_just_inside_timeout() {
        let fixture = Fixture::new();
        let mut server = fixture.server().with_clock(fixed_now);

        let request = fixture.auth_request(&server, &seconds_before_now(299), PASSWORD_HASH);
        let reply = fixture.open(&server.handle(&request).unwrap());
        assert_eq!(reply[field::AUTHENTICATED], true);

        let session_id = reply[field::SESSION].as_str().unwrap();
        assert_eq!(server.session(), Some(session_id));
        assert_eq!(
            fixture.store.load_session_public_key(session_id).unwrap().as_deref(),
            Some(fixture.client_key())
        );
    }

    #[test]
    fn test_wrong_password_is_rejected() {
        let fixture = Fixture::new();
        let mut server = fixture.server().with_clock(fixed_now);

        let request = fixture.auth_request(&server, &seconds_before_now(1), "not-the-hash");
        let reply = plain(&server.handle(&request).unwrap());
        assert_eq!(reply[field::AUTHENTICATED], false);
        assert_eq!(reply[field::MESSAGE], reply_text::AUTH_FAILED);
    }

    #[test]
    fn test_unparsable_timestamp_never_counts_as_fresh() {
        let fixture = Fixture::new();
        let mut server = fixture.server();

        let request = fixture.auth_request(&server, "yesterday-ish", PASSWORD_HASH);
        let reply = plain(&server.handle(&request).unwrap());
        assert_eq!(reply[field::AUTHENTICATED], false);
    }

    #[test]
    fn test_session_resolved_from_encrypted_data() {
        let fixture = Fixture::new();
        fixture
            .store
            .save_session_public_key("abcdef0123456", fixture.client_key())
            .unwrap();

        let mut server = fixture.server();
        server
            .register("ping", |_| HandlerOutput::new().with("status", "ok"))
            .unwrap();
        server.establish_whitelist(&["ping"]).unwrap();

        let datos = fixture.encrypt_for(&server, r#"{"sesion":"abcdef0123456"}"#);
        let reply = server
            .handle(&RequestEnvelope::new("ping").with_data(&datos))
            .unwrap();

        assert_eq!(server.session(), Some("abcdef0123456"));
        assert_eq!(fixture.open(&reply), serde_json::json!({"status": "ok"}));
    }

    #[test]
    fn test_late_traffic_carries_refresh_pair() {
        let fixture = Fixture::new();
        let mut keys = KeyManager::new(&fixture.config.keys).unwrap();
        let old_key = keys.public_key().unwrap().to_string();
        let datos = KeyManager::encrypt(br#"{"x":"1"}"#, &old_key, 1024).unwrap();
        keys.rotate().unwrap();
        let new_key = keys.public_key().unwrap().to_string();
        drop(keys);

        let mut server = fixture.server();
        let reply = plain(&server.handle(&RequestEnvelope::new("unlisted").with_data(&datos)).unwrap());

        assert_eq!(reply[field::SERVER_KEY], new_key.as_str());
        let check = KeyManager::verify(
            new_key.as_bytes(),
            reply[field::SERVER_KEY_SIGNATURE].as_str().unwrap(),
            &old_key,
            1024,
            Some(HashAlgorithm::Sha512),
        );
        assert!(check.valid);
    }

    #[test]
    fn test_client_key_update_requires_signature_from_bound_key() {
        let fixture = Fixture::new();
        fixture
            .store
            .save_session_public_key("abcdef0123456", fixture.client_key())
            .unwrap();

        let other_dir = tempfile::tempdir().unwrap();
        let impostor = KeyManager::new(&keys_config(other_dir.path())).unwrap();
        let new_key = impostor.public_key().unwrap().to_string();

        let send_update = |signer: &KeyManager| {
            let mut server = fixture.server();
            let body = serde_json::json!({
                "sesion": "abcdef0123456",
                "ll_cte": new_key,
                "firma_ll_cte": signer.sign(new_key.as_bytes(), false, false).signature.unwrap(),
                "tipo_huella": "sha512",
            });
            let datos = fixture.encrypt_for(&server, &body.to_string());
            let request = RequestEnvelope::new(method::UPDATE_CLIENT_KEY).with_data(&datos);
            server.handle(&request).unwrap()
        };

        let rejected = fixture.open(&send_update(&impostor));
        assert_eq!(rejected[field::UPDATED], false);

        send_update(&fixture.client);
        assert_eq!(
            fixture.store.load_session_public_key("abcdef0123456").unwrap(),
            Some(new_key.clone())
        );
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-05-01 12:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T12:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T14:00:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("01/05/2024"), None);
    }
}
