use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use super::cipher::{self, parse_public_key};
use super::hash::HashAlgorithm;
use super::keystore::{FileKeyStore, KeyStore, RotateOutcome, StoredKeyPair};
use crate::config::KeyManagerConfig;
use crate::error::{SecRestError, SecRestResult};

/// One generation of key material
pub struct KeyPair {
    public_pem: String,
    private_key: RsaPrivateKey,
    created_at: DateTime<Utc>,
}

impl KeyPair {
    /// Parse a stored pair, rejecting a public key that does not belong to the private key
    fn from_stored(stored: &StoredKeyPair) -> SecRestResult<Self> {
        let pem = stored.private_pem.trim();
        let private_key = match RsaPrivateKey::from_pkcs8_pem(pem) {
            Ok(key) => key,
            Err(pkcs8_err) => RsaPrivateKey::from_pkcs1_pem(pem)
                .map_err(|_| SecRestError::InvalidKey(pkcs8_err.to_string()))?,
        };

        let public_key = parse_public_key(&stored.public_pem)?;
        if RsaPublicKey::from(&private_key) != public_key {
            return Err(SecRestError::InvalidKey(
                "public key does not match private key".to_string(),
            ));
        }

        Ok(Self {
            public_pem: stored.public_pem.clone(),
            private_key,
            created_at: DateTime::<Utc>::from(stored.modified),
        })
    }

    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`KeyManager::decrypt`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    /// `None` when no key could decrypt every block
    pub plaintext: Option<Vec<u8>>,
    /// The retiring key was needed: the sender should fetch our new public key
    pub refresh_needed: bool,
}

impl Decrypted {
    fn failed(refresh_needed: bool) -> Self {
        Self {
            plaintext: None,
            refresh_needed,
        }
    }

    /// Plaintext as UTF-8 text
    pub fn text(&self) -> Option<String> {
        self.plaintext
            .as_ref()
            .and_then(|bytes| String::from_utf8(bytes.clone()).ok())
    }
}

/// Outcome of [`KeyManager::sign`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Detached signature or sealed message, base64; `None` if signing failed
    pub signature: Option<String>,
    /// Public key that verifies it
    pub public_key: Option<String>,
    /// Digest used for a detached signature, `None` for a seal
    pub hash_algorithm: Option<HashAlgorithm>,
}

/// Outcome of [`KeyManager::verify`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// The recovered message for a seal, the checked message otherwise
    pub message: Vec<u8>,
    pub valid: bool,
}

/// Owns the current and retiring RSA key pairs of one party.
///
/// Keys older than the rotation interval are retired on construction (and
/// on [`KeyManager::refresh`]); only one retiring generation is kept, so a
/// message encrypted for us only decrypts until the next rotation. Peers
/// should keep round trips well under half the rotation interval.
pub struct KeyManager {
    store: Box<dyn KeyStore>,
    rotation_interval: i64,
    key_bits: usize,
    hash_algorithm: HashAlgorithm,
    current: Option<KeyPair>,
    previous: Option<KeyPair>,
    valid: bool,
}

impl KeyManager {
    /// Open (or create) the key files described by `config`
    pub fn new(config: &KeyManagerConfig) -> SecRestResult<Self> {
        config.validate()?;
        let store = FileKeyStore::new(&config.directory, &config.base_name);
        Self::with_store(config, Box::new(store))
    }

    /// Build a manager over an arbitrary key store
    pub fn with_store(config: &KeyManagerConfig, store: Box<dyn KeyStore>) -> SecRestResult<Self> {
        if config.rotation_interval < 0 {
            return Err(SecRestError::ConfigError(format!(
                "rotation interval must be non-negative, got {}",
                config.rotation_interval
            )));
        }

        let mut manager = Self {
            store,
            rotation_interval: config.rotation_interval,
            key_bits: config.key_bits,
            hash_algorithm: config.hash_algorithm,
            current: None,
            previous: None,
            valid: false,
        };
        manager.refresh()?;
        Ok(manager)
    }

    /// Reload key material, generating a pair if none exists and retiring
    /// the current pair if it outlived the rotation interval.
    pub fn refresh(&mut self) -> SecRestResult<()> {
        let stored = match self.store.load() {
            Ok(stored) => stored,
            Err(e) => {
                warn!(store = %self.store.location(), error = %e, "key material unreadable");
                self.invalidate();
                return Ok(());
            }
        };

        match &stored.current {
            None => {
                info!(store = %self.store.location(), "no key pair found, generating one");
                self.install_fresh_pair(None)?;
            }
            Some(pair) if self.is_expired(pair) => {
                info!(store = %self.store.location(), "key pair expired, rotating");
                self.install_fresh_pair(Some(&pair.public_pem))?;
            }
            Some(_) => {}
        }

        self.reload()
    }

    /// Retire the current pair right away
    ///
    /// If another instance rotated since we loaded, its pair is adopted instead.
    pub fn rotate(&mut self) -> SecRestResult<()> {
        let expected = match self.public_key() {
            Some(pem) => Some(pem.to_string()),
            // Nothing usable loaded: replace whatever is on disk
            None => self.store.load()?.current.map(|pair| pair.public_pem),
        };
        self.install_fresh_pair(expected.as_deref())?;
        self.reload()
    }

    fn reload(&mut self) -> SecRestResult<()> {
        let stored = match self.store.load() {
            Ok(stored) => stored,
            Err(e) => {
                warn!(store = %self.store.location(), error = %e, "key material unreadable");
                self.invalidate();
                return Ok(());
            }
        };

        match stored.current.as_ref().map(KeyPair::from_stored) {
            Some(Ok(pair)) => {
                self.current = Some(pair);
                self.valid = true;
            }
            Some(Err(e)) => {
                warn!(store = %self.store.location(), error = %e, "current key pair is corrupt");
                self.invalidate();
                return Ok(());
            }
            None => {
                self.invalidate();
                return Ok(());
            }
        }

        self.previous = match stored.previous.as_ref().map(KeyPair::from_stored) {
            Some(Ok(pair)) => Some(pair),
            Some(Err(e)) => {
                warn!(store = %self.store.location(), error = %e, "ignoring corrupt retiring key pair");
                None
            }
            None => None,
        };
        Ok(())
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.current = None;
        self.previous = None;
    }

    fn is_expired(&self, pair: &StoredKeyPair) -> bool {
        match SystemTime::now().duration_since(pair.modified) {
            Ok(age) => age.as_secs() > self.rotation_interval as u64,
            Err(_) => false,
        }
    }

    fn install_fresh_pair(&self, expected_current: Option<&str>) -> SecRestResult<()> {
        let private_key = RsaPrivateKey::new(&mut OsRng, self.key_bits)
            .map_err(|e| SecRestError::KeyGenerationError(e.to_string()))?;
        let private_pem = private_key.to_pkcs8_pem(LineEnding::LF)?;
        let public_pem = RsaPublicKey::from(&private_key).to_public_key_pem(LineEnding::LF)?;

        match self.store.rotate(expected_current, &private_pem, &public_pem)? {
            RotateOutcome::Rotated => {}
            RotateOutcome::Superseded => {
                debug!(store = %self.store.location(), "another instance rotated first, using its keys");
            }
        }
        Ok(())
    }

    fn live_pair(&self, use_old_pair: bool) -> Option<&KeyPair> {
        if !self.valid {
            return None;
        }
        if use_old_pair {
            self.previous.as_ref()
        } else {
            self.current.as_ref()
        }
    }

    /// Current public key (PEM)
    pub fn public_key(&self) -> Option<&str> {
        self.live_pair(false).map(KeyPair::public_pem)
    }

    /// Retiring public key (PEM), if a retiring pair exists
    pub fn previous_public_key(&self) -> Option<&str> {
        self.live_pair(true).map(KeyPair::public_pem)
    }

    /// Creation time of the current pair
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.live_pair(false).map(KeyPair::created_at)
    }

    pub fn rotation_interval(&self) -> i64 {
        self.rotation_interval
    }

    pub fn key_bits(&self) -> usize {
        self.key_bits
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    /// Whether the key material loaded cleanly
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Encrypt `message` for the owner of `recipient_public_key`.
    ///
    /// Returns `None` if the key does not parse or any block fails.
    pub fn encrypt(message: &[u8], recipient_public_key: &str, key_bits: usize) -> Option<String> {
        let recipient = parse_public_key(recipient_public_key).ok()?;
        cipher::encrypt_framed(message, &recipient, key_bits)
    }

    /// Decrypt a message sent to us, falling back to the retiring key.
    pub fn decrypt(&self, ciphertext: &str) -> Decrypted {
        let Some(current) = self.live_pair(false) else {
            return Decrypted::failed(false);
        };
        let Some(blocks) = cipher::unframe(ciphertext) else {
            return Decrypted::failed(false);
        };
        let Some((first, rest)) = blocks.split_first() else {
            return Decrypted::failed(false);
        };

        // The first block decides which key the sender used
        let (pair, mut plaintext, refresh_needed) =
            match cipher::decrypt_block(&current.private_key, first) {
                Some(block) => (current, block, false),
                None => {
                    let retiring = self.previous.as_ref().and_then(|old| {
                        cipher::decrypt_block(&old.private_key, first).map(|block| (old, block))
                    });
                    match retiring {
                        Some((old, block)) => {
                            debug!("message was encrypted for the retiring key");
                            (old, block, true)
                        }
                        None => return Decrypted::failed(false),
                    }
                }
            };

        // Every later block must open with that same key
        for block in rest {
            match cipher::decrypt_block(&pair.private_key, block) {
                Some(decrypted) => plaintext.extend_from_slice(&decrypted),
                None => return Decrypted::failed(refresh_needed),
            }
        }

        Decrypted {
            plaintext: Some(plaintext),
            refresh_needed,
        }
    }

    /// Sign `message` with our private key.
    ///
    /// A seal encrypts the whole message so any holder of the public key can
    /// read it; a detached signature covers only the digest of the message.
    /// `use_old_pair` signs with the retiring pair, which lets a peer that
    /// still trusts our previous public key verify a freshly rotated one.
    pub fn sign(&self, message: &[u8], sealed: bool, use_old_pair: bool) -> Signature {
        let pair = self.live_pair(use_old_pair);
        let payload = if sealed {
            general_purpose::STANDARD.encode(message)
        } else {
            general_purpose::STANDARD.encode(self.hash_algorithm.hex_digest(message))
        };

        Signature {
            signature: pair.and_then(|p| cipher::seal_framed(payload.as_bytes(), &p.private_key)),
            public_key: pair.map(|p| p.public_pem.clone()),
            hash_algorithm: (!sealed).then_some(self.hash_algorithm),
        }
    }

    /// Check a signature produced by [`KeyManager::sign`].
    ///
    /// With a `hash_algorithm` the signature is detached and is compared
    /// against a fresh digest of `message`; without one it is a seal and the
    /// recovered text is returned as the message.
    pub fn verify(
        message: &[u8],
        signature: &str,
        public_key: &str,
        key_bits: usize,
        hash_algorithm: Option<HashAlgorithm>,
    ) -> Verification {
        let recovered = parse_public_key(public_key)
            .ok()
            .and_then(|key| cipher::open_sealed(signature, &key, key_bits))
            .and_then(|payload| general_purpose::STANDARD.decode(payload).ok());

        match hash_algorithm {
            Some(algorithm) => Verification {
                message: message.to_vec(),
                valid: recovered
                    .map(|digest| digest == algorithm.hex_digest(message).as_bytes())
                    .unwrap_or(false),
            },
            None => match recovered {
                Some(sealed) => Verification {
                    message: sealed,
                    valid: true,
                },
                None => Verification {
                    message: Vec::new(),
                    valid: false,
                },
            },
        }
    }
}
