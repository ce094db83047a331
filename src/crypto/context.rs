//! Crypto Context
//!
//! Owns one identity keypair and the trust-on-first-use cache of peer
//! static keys. Created explicitly and shared as `Arc<CryptoContext>`, so
//! a single process (or test) can run several independent identities.

use parking_lot::RwLock;
use std::collections::HashMap;

use super::envelope::{self, SealedMessage};
use super::keys::{PeerPublicKey, StaticKeypair};
use super::CryptoError;

pub struct CryptoContext {
    identity: StaticKeypair,
    peer_keys: RwLock<HashMap<String, PeerPublicKey>>,
}

impl CryptoContext {
    /// Generate a fresh identity. Fails only if the OS random source does.
    pub fn new() -> Result<Self, CryptoError> {
        Ok(Self::with_identity(StaticKeypair::generate()?))
    }

    pub fn with_identity(identity: StaticKeypair) -> Self {
        Self {
            identity,
            peer_keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn public_key(&self) -> PeerPublicKey {
        self.identity.public_key()
    }

    pub fn public_key_base64(&self) -> String {
        self.identity.public_key().to_base64()
    }

    /// Cache a peer's static key, replacing any previous one.
    ///
    /// Returns the replaced key. No verification happens here: the first
    /// key seen for a nickname is trusted, and later ones silently win.
    pub fn store_peer_key(&self, nick: &str, key: PeerPublicKey) -> Option<PeerPublicKey> {
        let previous = self.peer_keys.write().insert(nick.to_string(), key);
        match previous {
            Some(old) if old != key => log::info!("Static key for {} changed", nick),
            None => log::debug!("Cached static key for {}", nick),
            _ => {}
        }
        previous
    }

    pub fn peer_key(&self, nick: &str) -> Option<PeerPublicKey> {
        self.peer_keys.read().get(nick).copied()
    }

    pub fn knows_peer(&self, nick: &str) -> bool {
        self.peer_keys.read().contains_key(nick)
    }

    /// Nicknames with a cached key
    pub fn known_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.peer_keys.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Seal `plaintext` for a peer with a cached key, returning the MSG payload
    pub fn encrypt_for(&self, nick: &str, plaintext: &[u8]) -> Result<String, CryptoError> {
        let key = self
            .peer_key(nick)
            .ok_or_else(|| CryptoError::UnknownPeer(nick.to_string()))?;
        Ok(envelope::seal(&key, plaintext)?.to_payload())
    }

    /// Open a MSG payload addressed to this identity
    pub fn decrypt_payload(&self, payload: &str) -> Result<Vec<u8>, CryptoError> {
        let sealed = SealedMessage::from_payload(payload)?;
        envelope::open(&self.identity, &sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_between_contexts() {
        let alice = CryptoContext::new().unwrap();
        let bob = CryptoContext::new().unwrap();

        let bob_key = PeerPublicKey::from_base64(&bob.public_key_base64()).unwrap();
        alice.store_peer_key("bob", bob_key);

        let payload = alice.encrypt_for("bob", b"hello").unwrap();
        assert_eq!(bob.decrypt_payload(&payload).unwrap(), b"hello");
    }

    #[test]
    fn test_unknown_peer() {
        let alice = CryptoContext::new().unwrap();
        assert!(matches!(
            alice.encrypt_for("nobody", b"hi"),
            Err(CryptoError::UnknownPeer(nick)) if nick == "nobody"
        ));
    }

    #[test]
    fn test_later_key_overwrites() {
        let ctx = CryptoContext::new().unwrap();
        let first = StaticKeypair::generate().unwrap().public_key();
        let second = StaticKeypair::generate().unwrap().public_key();

        assert_eq!(ctx.store_peer_key("bob", first), None);
        assert_eq!(ctx.store_peer_key("bob", second), Some(first));
        assert_eq!(ctx.peer_key("bob"), Some(second));
        assert_eq!(ctx.known_peers(), vec!["bob".to_string()]);
    }

    #[test]
    fn test_independent_identities() {
        let a = CryptoContext::new().unwrap();
        let b = CryptoContext::new().unwrap();
        assert_ne!(a.public_key(), b.public_key());

        a.store_peer_key("carol", b.public_key());
        assert!(a.knows_peer("carol"));
        assert!(!b.knows_peer("carol"));
    }

    #[test]
    fn test_garbage_payload_is_an_error() {
        let ctx = CryptoContext::new().unwrap();
        assert!(ctx.decrypt_payload("a:b").is_err());
        assert!(ctx.decrypt_payload("").is_err());
    }
}
