//! Cryptography module for SecREST
//!
//! This module provides:
//! - Key lifecycle (RSA key pairs persisted on disk, rotated on expiry)
//! - Chunked RSA encryption, sealing and detached signatures
//! - Digests for signatures and login tokens

pub mod cipher;
pub mod hash;
pub mod keys;
pub mod keystore;

pub use hash::{login_token, HashAlgorithm};
pub use keys::{Decrypted, KeyManager, KeyPair, Signature, Verification};
pub use keystore::{FileKeyStore, KeyStore, RotateOutcome, StoredKeyPair, StoredKeys};
