//! Message digests used for detached signatures and login tokens

use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

/// Digest algorithm applied to a message before a detached signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    #[default]
    Sha512,
}

impl HashAlgorithm {
    /// Name used on the wire and in configuration
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Parse an algorithm id, falling back to sha512 for anything unknown
    pub fn from_name_or_default(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }

    /// Lowercase hex digest of `data`
    pub fn hex_digest(&self, data: &[u8]) -> String {
        match self {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            HashAlgorithm::Sha384 => hex::encode(Sha384::digest(data)),
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            _ => Err(format!("Unsupported hash algorithm: {}", s)),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Login token sent during authentication: `sha512(password_hash || timestamp)` in hex
pub fn login_token(password_hash: &str, timestamp: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(password_hash.as_bytes());
    hasher.update(timestamp.as_bytes());
    hex::encode(hasher.finalize())
}
