//! Simple-SecREST: confidential, authenticated RPC over plain HTTP
//!
//! Every party owns an RSA key pair that rotates on a fixed interval. Requests
//! and replies are encrypted block by block with the peer's public key, so the
//! transport never needs TLS.

pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod sessiondb;
pub mod store;
pub mod transport;

pub use config::{ClientConfig, KeyManagerConfig, ServerConfig};
pub use crypto::{Decrypted, HashAlgorithm, KeyManager, Signature, Verification};
pub use error::{SecRestError, SecRestResult};
pub use protocol::{ClientProtocol, ClientState, HandlerOutput, ServerProtocol};
pub use sessiondb::SessionDb;
pub use store::{CredentialStore, MemoryStore, ServerStore, SessionKeyStore, SessionStore};
pub use transport::{LoopbackTransport, Transport};
