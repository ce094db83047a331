//! GhostCat - End-to-End Encrypted LAN Chat Library
//!
//! Peers connect over TLS to a relay that routes opaque encrypted lines by
//! nickname. Message confidentiality comes from X25519 + HKDF + AES-GCM
//! envelopes that only the addressed peer can open.

pub mod attachment;
pub mod client;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod discovery;
pub mod handshake;
pub mod protocol;
pub mod server;
pub mod tls;

pub use client::{ClientError, ConnectOptions, LineHandler, PeerConnection};
pub use config::{ClientConfig, ServerConfig};
pub use crypto::context::CryptoContext;
pub use handshake::{InboundEvent, KeyExchangeCoordinator, SendOutcome};
pub use protocol::Frame;
pub use server::{RelayServer, ServerPhase};
pub use tls::ClientTrust;
