use thiserror::Error;

/// Main error type for the SecREST library
#[derive(Error, Debug)]
pub enum SecRestError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Key directory unusable: {0}")]
    KeyDirectory(String),

    #[error("Method not implemented by this server: {0}")]
    UnknownMethod(String),

    // Key material errors
    #[error("Cryptographic operation failed: {0}")]
    CryptoError(String),

    #[error("RSA key generation failed: {0}")]
    KeyGenerationError(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Key store is not usable: no valid key pair loaded")]
    InvalidKeyStore,

    // Persistence errors
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Session store error: {0}")]
    StoreError(String),

    // Protocol errors
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Handshake with {0} failed")]
    HandshakeFailed(String),

    // General errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type alias for SecREST operations
pub type SecRestResult<T> = Result<T, SecRestError>;

// Conversion implementations for common error types
impl From<rusqlite::Error> for SecRestError {
    fn from(err: rusqlite::Error) -> Self {
        SecRestError::DatabaseError(err.to_string())
    }
}

impl From<rsa::Error> for SecRestError {
    fn from(err: rsa::Error) -> Self {
        SecRestError::CryptoError(err.to_string())
    }
}

impl From<rsa::pkcs8::Error> for SecRestError {
    fn from(err: rsa::pkcs8::Error) -> Self {
        SecRestError::InvalidKey(err.to_string())
    }
}

impl From<rsa::pkcs8::spki::Error> for SecRestError {
    fn from(err: rsa::pkcs8::spki::Error) -> Self {
        SecRestError::InvalidPublicKey(err.to_string())
    }
}

impl From<base64::DecodeError> for SecRestError {
    fn from(err: base64::DecodeError) -> Self {
        SecRestError::InvalidMessage(format!("Base64 decode error: {}", err))
    }
}

impl From<std::string::FromUtf8Error> for SecRestError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        SecRestError::InvalidMessage(format!("UTF-8 decode error: {}", err))
    }
}
