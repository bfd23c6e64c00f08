//! Handshake and dispatch between a SecREST client and server
//!
//! A client greets the server with its public key, authenticates with a
//! login token encrypted for the server, and then issues RPCs tagged with
//! its session id. Either side may rotate keys at any time; the server
//! signals its own rotation in-band and the client re-registers its key
//! when a reply was encrypted for its retiring pair.

pub mod client;
pub mod server;
pub mod wire;

pub use client::{ClientProtocol, ClientState};
pub use server::{HandlerOutput, Request, ServerProtocol};
pub use wire::{RefreshSignal, RequestEnvelope};
