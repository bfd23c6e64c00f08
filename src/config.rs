use std::fs;
use std::path::{Path, PathBuf};

use crate::crypto::cipher::DEFAULT_KEY_BITS;
use crate::crypto::HashAlgorithm;
use crate::error::{SecRestError, SecRestResult};

/// Default lifetime of a key pair in seconds (5 minutes)
pub const DEFAULT_ROTATION_INTERVAL: i64 = 300;

/// Default base name for the key files
pub const DEFAULT_KEY_BASE_NAME: &str = "REST_key";

/// Key sizes the framing understands
pub const SUPPORTED_KEY_BITS: [usize; 4] = [1024, 2048, 3072, 4096];

/// Characters that may not appear in a key file base name
const FORBIDDEN_NAME_CHARS: &[char] = &['/', '?', '*', ';', ':', '{', '}', '\\'];

/// Key manager configuration
#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    /// Directory holding `<base>.crt`, `<base>.pub` and the `_old` pair
    pub directory: PathBuf,
    pub base_name: String,
    /// Seconds a key pair may live before it is retired
    pub rotation_interval: i64,
    pub key_bits: usize,
    pub hash_algorithm: HashAlgorithm,
}

impl KeyManagerConfig {
    /// Create a configuration with the default base name, key size and digest
    pub fn new<P: AsRef<Path>>(directory: P, rotation_interval: i64) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            base_name: DEFAULT_KEY_BASE_NAME.to_string(),
            rotation_interval,
            key_bits: DEFAULT_KEY_BITS,
            hash_algorithm: HashAlgorithm::default(),
        }
    }

    pub fn with_base_name(mut self, base_name: &str) -> Self {
        self.base_name = base_name.to_string();
        self
    }

    pub fn with_key_bits(mut self, key_bits: usize) -> Self {
        self.key_bits = key_bits;
        self
    }

    pub fn with_hash_algorithm(mut self, hash_algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = hash_algorithm;
        self
    }

    /// Validate the configuration, including that the directory is writable
    pub fn validate(&self) -> SecRestResult<()> {
        if self.rotation_interval < 0 {
            return Err(SecRestError::ConfigError(format!(
                "rotation interval must be non-negative, got {}",
                self.rotation_interval
            )));
        }

        if !SUPPORTED_KEY_BITS.contains(&self.key_bits) {
            return Err(SecRestError::ConfigError(format!(
                "unsupported key size {} (use one of {:?})",
                self.key_bits, SUPPORTED_KEY_BITS
            )));
        }

        if self.base_name.is_empty() || self.base_name.contains(FORBIDDEN_NAME_CHARS) {
            return Err(SecRestError::ConfigError(format!(
                "invalid key base name: {:?}",
                self.base_name
            )));
        }

        ensure_writable_dir(&self.directory)
    }
}

/// Check that `dir` exists, is a directory and accepts new files
fn ensure_writable_dir(dir: &Path) -> SecRestResult<()> {
    let metadata = fs::metadata(dir).map_err(|e| {
        SecRestError::KeyDirectory(format!("{}: {}", dir.display(), e))
    })?;
    if !metadata.is_dir() {
        return Err(SecRestError::KeyDirectory(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let check = dir.join(format!(".secrest-write-check-{}", std::process::id()));
    fs::write(&check, b"")
        .and_then(|_| fs::remove_file(&check))
        .map_err(|e| SecRestError::KeyDirectory(format!("{} is not writable: {}", dir.display(), e)))
}

/// Server-side configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub keys: KeyManagerConfig,
    /// Maximum accepted age, in seconds, of a client's login timestamp
    pub timeout: i64,
}

impl ServerConfig {
    /// The login timeout defaults to the key rotation interval
    pub fn new(keys: KeyManagerConfig) -> Self {
        let timeout = keys.rotation_interval;
        Self { keys, timeout }
    }

    pub fn with_timeout(mut self, timeout: i64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> SecRestResult<()> {
        if self.timeout < 0 {
            return Err(SecRestError::ConfigError(format!(
                "timeout must be non-negative, got {}",
                self.timeout
            )));
        }
        self.keys.validate()
    }
}

/// Client-side configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Service URL, without query string
    pub endpoint: String,
    pub login: String,
    /// Hex sha512 of the user's password
    pub password_hash: String,
    /// Moment the connection is established, sent to the server verbatim
    pub timestamp: String,
    /// Client key material; its rotation interval bounds how long credentials stay usable
    pub keys: KeyManagerConfig,
}

impl ClientConfig {
    pub fn new(
        endpoint: &str,
        login: &str,
        password_hash: &str,
        timestamp: &str,
        keys: KeyManagerConfig,
    ) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            login: login.to_string(),
            password_hash: password_hash.to_string(),
            timestamp: timestamp.to_string(),
            keys,
        }
    }

    pub fn validate(&self) -> SecRestResult<()> {
        if self.endpoint.is_empty() {
            return Err(SecRestError::ConfigError("endpoint cannot be empty".to_string()));
        }
        if self.endpoint.contains('?') {
            return Err(SecRestError::ConfigError(format!(
                "endpoint must not carry a query string: {}",
                self.endpoint
            )));
        }
        self.keys.validate()
    }
}
