//! Per-Message Envelope
//!
//! ECIES-style construction: the sender agrees a secret between a fresh
//! ephemeral key and the recipient's static key, derives an AES key with
//! HKDF and encrypts under a random IV. The wire form is
//! `ephPubB64:ivB64:ciphertextB64`.
//!
//! This gives forward secrecy per message but no sender authentication.
//! Anyone holding the recipient's static public key can produce an envelope
//! that opens cleanly, and the nickname in the surrounding MSG frame is not
//! bound to any key.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use super::cipher::{self, IV_LEN};
use super::keys::{EphemeralKeypair, PeerPublicKey, StaticKeypair};
use super::CryptoError;

/// An encrypted message as carried in the MSG payload field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    pub ephemeral_public: PeerPublicKey,
    pub iv: [u8; IV_LEN],
    /// Ciphertext with the GCM tag appended
    pub ciphertext: Vec<u8>,
}

impl SealedMessage {
    /// Encode as the colon-joined base64 triple
    pub fn to_payload(&self) -> String {
        format!(
            "{}:{}:{}",
            self.ephemeral_public.to_base64(),
            BASE64.encode(self.iv),
            BASE64.encode(&self.ciphertext)
        )
    }

    /// Parse the colon-joined base64 triple
    pub fn from_payload(payload: &str) -> Result<Self, CryptoError> {
        let parts: Vec<&str> = payload.splitn(3, ':').collect();
        let [eph, iv, ct] = parts[..] else {
            return Err(CryptoError::MalformedEnvelope(format!(
                "expected 3 fields, got {}",
                parts.len()
            )));
        };

        let ephemeral_public = PeerPublicKey::from_base64(eph)?;
        let iv_bytes = BASE64
            .decode(iv)
            .map_err(|e| CryptoError::MalformedEnvelope(format!("iv: {}", e)))?;
        let iv: [u8; IV_LEN] = iv_bytes.as_slice().try_into().map_err(|_| {
            CryptoError::MalformedEnvelope(format!(
                "iv must be {} bytes, got {}",
                IV_LEN,
                iv_bytes.len()
            ))
        })?;
        let ciphertext = BASE64
            .decode(ct)
            .map_err(|e| CryptoError::MalformedEnvelope(format!("ciphertext: {}", e)))?;

        Ok(Self {
            ephemeral_public,
            iv,
            ciphertext,
        })
    }
}

/// Encrypt `plaintext` to the holder of `recipient`'s static private key.
///
/// The ephemeral private key is consumed by the agreement and dropped here.
pub fn seal(recipient: &PeerPublicKey, plaintext: &[u8]) -> Result<SealedMessage, CryptoError> {
    let ephemeral = EphemeralKeypair::generate()?;
    let ephemeral_public = ephemeral.public_key();
    let shared = ephemeral.agree(recipient)?;
    let key = cipher::message_key(&shared)?;
    let iv = cipher::random_iv()?;
    let ciphertext = cipher::encrypt(plaintext, &key, &iv)?;

    Ok(SealedMessage {
        ephemeral_public,
        iv,
        ciphertext,
    })
}

/// Decrypt an envelope addressed to `identity`
pub fn open(identity: &StaticKeypair, sealed: &SealedMessage) -> Result<Vec<u8>, CryptoError> {
    let shared = identity.agree(&sealed.ephemeral_public)?;
    let key = cipher::message_key(&shared)?;
    cipher::decrypt(&sealed.ciphertext, &key, &sealed.iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let bob = StaticKeypair::generate().unwrap();
        let sealed = seal(&bob.public_key(), b"hello").unwrap();
        assert_eq!(open(&bob, &sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_payload_survives_wire_encoding() {
        let bob = StaticKeypair::generate().unwrap();
        let payload = seal(&bob.public_key(), "héllo wörld".as_bytes())
            .unwrap()
            .to_payload();

        assert_eq!(payload.split(':').count(), 3);
        assert!(!payload.contains('|'));

        let parsed = SealedMessage::from_payload(&payload).unwrap();
        assert_eq!(open(&bob, &parsed).unwrap(), "héllo wörld".as_bytes());
    }

    #[test]
    fn test_fresh_ephemeral_per_message() {
        let bob = StaticKeypair::generate().unwrap();
        let a = seal(&bob.public_key(), b"same").unwrap();
        let b = seal(&bob.public_key(), b"same").unwrap();
        assert_ne!(a.ephemeral_public, b.ephemeral_public);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_recipient_fails_authentication() {
        let bob = StaticKeypair::generate().unwrap();
        let eve = StaticKeypair::generate().unwrap();
        let sealed = seal(&bob.public_key(), b"for bob").unwrap();
        assert!(matches!(
            open(&eve, &sealed),
            Err(CryptoError::AuthenticationFailure)
        ));
    }

    #[test]
    fn test_swapped_ephemeral_fails_authentication() {
        let bob = StaticKeypair::generate().unwrap();
        let mut sealed = seal(&bob.public_key(), b"payload").unwrap();
        sealed.ephemeral_public = seal(&bob.public_key(), b"other").unwrap().ephemeral_public;
        assert!(matches!(
            open(&bob, &sealed),
            Err(CryptoError::AuthenticationFailure)
        ));
    }

    #[test]
    fn test_malformed_payloads() {
        let bob = StaticKeypair::generate().unwrap();
        let good = seal(&bob.public_key(), b"x").unwrap().to_payload();
        let fields: Vec<&str> = good.split(':').collect();

        assert!(matches!(
            SealedMessage::from_payload("onlyonefield"),
            Err(CryptoError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            SealedMessage::from_payload(&format!("{}:{}", fields[0], fields[1])),
            Err(CryptoError::MalformedEnvelope(_))
        ));
        // short IV
        let short_iv = format!("{}:{}:{}", fields[0], BASE64.encode([0u8; 8]), fields[2]);
        assert!(matches!(
            SealedMessage::from_payload(&short_iv),
            Err(CryptoError::MalformedEnvelope(_))
        ));
        // bad ephemeral key
        let bad_key = format!("{}:{}:{}", BASE64.encode([1u8; 5]), fields[1], fields[2]);
        assert!(matches!(
            SealedMessage::from_payload(&bad_key),
            Err(CryptoError::InvalidPeerKey(_))
        ));
    }
}
