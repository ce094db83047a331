//! End-to-End Cryptography Module
//!
//! X25519 identity and ephemeral keys, HKDF-SHA256 key derivation and
//! AES-256-GCM message encryption. The relay never sees any of this:
//! it only forwards the base64 triples produced by [`envelope::seal`].

pub mod cipher;
pub mod context;
pub mod envelope;
pub mod keys;

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The OS random source failed. Fatal: no keys or IVs can be produced.
    #[error("Entropy source unavailable: {0}")]
    Entropy(String),
    #[error("Invalid peer key: {0}")]
    InvalidPeerKey(String),
    /// Tag verification failed (tampered ciphertext or wrong key).
    #[error("Authentication failure")]
    AuthenticationFailure,
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Malformed encrypted payload: {0}")]
    MalformedEnvelope(String),
    #[error("No static key cached for {0}")]
    UnknownPeer(String),
}
