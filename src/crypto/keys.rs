//! X25519 Key Material
//!
//! A process holds one [`StaticKeypair`] (its identity) and generates a
//! fresh [`EphemeralKeypair`] for every outbound message.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::CryptoError;

/// Length of an encoded X25519 public key
pub const PUBLIC_KEY_LEN: usize = 32;

/// A peer's X25519 public key, as received on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerPublicKey(PublicKey);

impl PeerPublicKey {
    /// Parse a raw public key. Anything other than exactly 32 bytes is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidPeerKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(PublicKey::from(raw)))
    }

    /// Parse a standard base64 public key as carried by REGISTER/KEY frames
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidPeerKey(format!("bad base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.0.as_bytes()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.as_bytes())
    }
}

/// Raw X25519 output. Zeroized on drop; feed it to
/// [`derive_key`](super::cipher::derive_key), never use it as a key directly.
pub struct SharedSecret(Zeroizing<[u8; 32]>);

impl SharedSecret {
    fn from_dalek(raw: x25519_dalek::SharedSecret) -> Result<Self, CryptoError> {
        // An all-zero result means the peer sent a low-order point.
        if !raw.was_contributory() {
            return Err(CryptoError::InvalidPeerKey(
                "non-contributory public key".to_string(),
            ));
        }
        Ok(Self(Zeroizing::new(raw.to_bytes())))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

fn secret_from_os_rng() -> Result<StaticSecret, CryptoError> {
    let mut seed = Zeroizing::new([0u8; 32]);
    OsRng
        .try_fill_bytes(&mut seed[..])
        .map_err(|e| CryptoError::Entropy(e.to_string()))?;
    Ok(StaticSecret::from(*seed))
}

/// Long-lived identity keypair. Held in memory only, never persisted.
pub struct StaticKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl StaticKeypair {
    /// Generate a new identity from the OS random source
    pub fn generate() -> Result<Self, CryptoError> {
        let secret = secret_from_os_rng()?;
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> PeerPublicKey {
        PeerPublicKey(self.public)
    }

    /// Static-side Diffie-Hellman against a peer's (usually ephemeral) key
    pub fn agree(&self, peer: &PeerPublicKey) -> Result<SharedSecret, CryptoError> {
        SharedSecret::from_dalek(self.secret.diffie_hellman(&peer.0))
    }
}

/// Single-use keypair for one outbound message.
///
/// Backed by a `StaticSecret` so the public half can be read before the
/// agreement; [`agree`](Self::agree) consumes it so it cannot be reused.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeypair {
    pub fn generate() -> Result<Self, CryptoError> {
        let secret = secret_from_os_rng()?;
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> PeerPublicKey {
        PeerPublicKey(self.public)
    }

    pub fn agree(self, peer: &PeerPublicKey) -> Result<SharedSecret, CryptoError> {
        SharedSecret::from_dalek(self.secret.diffie_hellman(&peer.0))
    }
}
