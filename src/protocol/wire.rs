//! Wire vocabulary and message shapes
//!
//! Requests travel as an HTTP GET query string; every field except the
//! method name and the greeting's public key is RSA-encrypted. Replies are
//! JSON objects, encrypted for the client once its public key is known.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use url::form_urlencoded;

/// Query and JSON field names
pub mod field {
    pub const METHOD: &str = "metodo";
    pub const DATA: &str = "datos";
    pub const CLIENT_PUBLIC_KEY: &str = "ll_publica_cliente";
    pub const SESSION: &str = "sesion";
    pub const SERVER_KEY: &str = "pkey";
    pub const SERVER_KEY_SIGNATURE: &str = "firma_pkey";
    pub const LOGIN: &str = "login";
    pub const TIMESTAMP: &str = "fecha";
    pub const TOKEN: &str = "token";
    pub const CLIENT_KEY: &str = "ll_cte";
    pub const CLIENT_KEY_SIGNATURE: &str = "firma_ll_cte";
    pub const DIGEST: &str = "tipo_huella";
    pub const AUTHENTICATED: &str = "autenticado";
    pub const MESSAGE: &str = "mensaje";
    pub const UPDATED: &str = "actualizado";
    pub const ERROR_ID: &str = "id_error";
    pub const ERROR: &str = "error";
}

/// Built-in method names
pub mod method {
    pub const GREETING: &str = "saludo";
    pub const AUTHENTICATE: &str = "autenticar";
    pub const UPDATE_CLIENT_KEY: &str = "actualizar_llave_publica_de_cliente";
}

/// Human readable messages returned to clients
pub mod reply_text {
    pub const AUTH_FAILED: &str = "Autenticación fallida";
    pub const AUTH_OK: &str = "AUTENTICADO EXITOSAMENTE";
    pub const AUTH_EXPIRED: &str = "Tiempo máximo de conexión caducado";
    pub const KEY_UPDATED: &str = "Llave pública actualizada";
    pub const KEY_REJECTED: &str = "Firma de la llave pública inválida";
    pub const SESSION_UNKNOWN: &str = "Sesión desconocida o vencida";
    pub const REPLY_NOT_ENCRYPTED: &str = "No fue posible cifrar la respuesta";

    pub fn unknown_method(name: &str) -> String {
        format!("Funcionalidad no existente [{}]", name)
    }
}

/// Fields that travel unencrypted
pub const FREE_FIELDS: [&str; 2] = [field::METHOD, field::CLIENT_PUBLIC_KEY];

/// Length of a session id
pub const SESSION_ID_LEN: usize = 13;

/// Whether `candidate` has the shape of a session id
pub fn is_session_id(candidate: &str) -> bool {
    candidate.len() == SESSION_ID_LEN && candidate.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Mint a fresh session id: 13 lowercase hex characters of a v4 UUID
pub fn mint_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(SESSION_ID_LEN);
    id
}

/// Server reply to a greeting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingReply {
    #[serde(rename = "pkey")]
    pub server_public_key: Option<String>,
    #[serde(rename = "sesion")]
    pub session_id: Option<String>,
}

/// Encrypted body of an authentication request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub login: String,
    #[serde(rename = "fecha")]
    pub timestamp: String,
    /// sha512(password_hash + timestamp)
    pub token: String,
    #[serde(rename = "ll_cte")]
    pub client_public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthReply {
    #[serde(rename = "autenticado")]
    pub authenticated: bool,
    #[serde(rename = "mensaje")]
    pub message: String,
    #[serde(rename = "sesion", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "ll_cte", default, skip_serializing_if = "Option::is_none")]
    pub client_public_key: Option<String>,
}

impl AuthReply {
    pub fn rejected(message: &str) -> Self {
        Self {
            authenticated: false,
            message: message.to_string(),
            session_id: None,
            client_public_key: None,
        }
    }
}

/// Encrypted body of a client key re-registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyUpdateRequest {
    #[serde(rename = "sesion")]
    pub session_id: String,
    #[serde(rename = "ll_cte")]
    pub client_public_key: String,
    /// Detached signature of the new key under the previous client key
    #[serde(rename = "firma_ll_cte")]
    pub signature: String,
    #[serde(rename = "tipo_huella", default)]
    pub hash_algorithm: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUpdateReply {
    #[serde(rename = "actualizado")]
    pub updated: bool,
    #[serde(rename = "mensaje")]
    pub message: String,
}

/// The server's new public key, signed with its retiring private key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSignal {
    #[serde(rename = "pkey")]
    pub public_key: String,
    #[serde(rename = "firma_pkey")]
    pub signature: String,
    #[serde(rename = "tipo_huella", default, skip_serializing_if = "Option::is_none")]
    pub hash_algorithm: Option<String>,
}

impl RefreshSignal {
    /// Remove a refresh pair from a reply, if it carries one
    pub fn take_from(payload: &mut Map<String, Value>) -> Option<Self> {
        let present = matches!(
            (payload.get(field::SERVER_KEY), payload.get(field::SERVER_KEY_SIGNATURE)),
            (Some(Value::String(_)), Some(Value::String(_)))
        );
        if !present {
            return None;
        }

        let public_key = payload.remove(field::SERVER_KEY);
        let signature = payload.remove(field::SERVER_KEY_SIGNATURE);
        let hash_algorithm = payload.remove(field::DIGEST);

        match (public_key, signature) {
            (Some(Value::String(public_key)), Some(Value::String(signature))) => Some(Self {
                public_key,
                signature,
                hash_algorithm: hash_algorithm.and_then(|v| v.as_str().map(str::to_string)),
            }),
            _ => None,
        }
    }

    /// Add the refresh pair to an outgoing reply
    pub fn merge_into(&self, payload: &mut Map<String, Value>) {
        payload.insert(field::SERVER_KEY.to_string(), Value::String(self.public_key.clone()));
        payload.insert(
            field::SERVER_KEY_SIGNATURE.to_string(),
            Value::String(self.signature.clone()),
        );
        if let Some(algorithm) = &self.hash_algorithm {
            payload.insert(field::DIGEST.to_string(), Value::String(algorithm.clone()));
        }
    }
}

/// One request as it appears in the query string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub method: Option<String>,
    /// Unencrypted fields other than the method
    pub free_fields: BTreeMap<String, String>,
    /// Every other field; `datos` carries a JSON object once decrypted
    pub encrypted_fields: BTreeMap<String, String>,
}

impl RequestEnvelope {
    pub fn new(method: &str) -> Self {
        Self {
            method: Some(method.to_string()),
            ..Self::default()
        }
    }

    pub fn with_free_field(mut self, name: &str, value: &str) -> Self {
        self.free_fields.insert(name.to_string(), value.to_string());
        self
    }

    /// Attach the encrypted `datos` blob
    pub fn with_data(mut self, ciphertext: &str) -> Self {
        self.encrypted_fields
            .insert(field::DATA.to_string(), ciphertext.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.method.is_none() && self.free_fields.is_empty() && self.encrypted_fields.is_empty()
    }

    /// Classify the pairs of a query string
    pub fn from_query(query: &str) -> Self {
        let mut envelope = Self::default();
        for (name, value) in form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
            if name == field::METHOD {
                envelope.method = Some(value.into_owned());
            } else if FREE_FIELDS.contains(&name.as_ref()) {
                envelope.free_fields.insert(name.into_owned(), value.into_owned());
            } else {
                envelope
                    .encrypted_fields
                    .insert(name.into_owned(), value.into_owned());
            }
        }
        envelope
    }

    pub fn to_query(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        if let Some(method) = &self.method {
            serializer.append_pair(field::METHOD, method);
        }
        for (name, value) in self.free_fields.iter().chain(self.encrypted_fields.iter()) {
            serializer.append_pair(name, value);
        }
        serializer.finish()
    }

    pub fn to_url(&self, endpoint: &str) -> String {
        format!("{}?{}", endpoint, self.to_query())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_shape() {
        let id = mint_session_id();
        assert!(is_session_id(&id));
        assert_ne!(id, mint_session_id());

        assert!(!is_session_id("short"));
        assert!(!is_session_id("abcdefghijkl!"));
        assert!(!is_session_id("abcdefghijklmn"));
    }

    #[test]
    fn test_query_classification() {
        let pem = "-----BEGIN PUBLIC KEY-----\nAB+/cd==\n-----END PUBLIC KEY-----\n";
        let envelope = RequestEnvelope::new(method::GREETING)
            .with_free_field(field::CLIENT_PUBLIC_KEY, pem)
            .with_data("Zm9v+YmFy/==");

        let query = envelope.to_query();
        assert!(query.starts_with("metodo=saludo&"));
        assert!(!query.contains('\n'));

        let parsed = RequestEnvelope::from_query(&query);
        assert_eq!(parsed, envelope);
        assert_eq!(parsed.free_fields[field::CLIENT_PUBLIC_KEY], pem);
        assert_eq!(parsed.encrypted_fields[field::DATA], "Zm9v+YmFy/==");
    }

    #[test]
    fn test_unknown_fields_are_treated_as_encrypted() {
        let parsed = RequestEnvelope::from_query("?metodo=ping&login=alice");
        assert_eq!(parsed.method.as_deref(), Some("ping"));
        assert!(parsed.free_fields.is_empty());
        assert_eq!(parsed.encrypted_fields["login"], "alice");
        assert!(RequestEnvelope::from_query("").is_empty());
    }

    #[test]
    fn test_refresh_signal_is_stripped_from_reply() {
        let mut reply: Map<String, Value> =
            serde_json::from_str(r#"{"status":"ok","pkey":"new","firma_pkey":"sig"}"#).unwrap();
        let signal = RefreshSignal::take_from(&mut reply).unwrap();

        assert_eq!(signal.public_key, "new");
        assert_eq!(signal.signature, "sig");
        assert_eq!(Value::Object(reply), serde_json::json!({"status": "ok"}));
    }

    #[test]
    fn test_auth_reply_omits_absent_session() {
        let json = serde_json::to_value(AuthReply::rejected(reply_text::AUTH_FAILED)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"autenticado": false, "mensaje": "Autenticación fallida"})
        );
    }
}
