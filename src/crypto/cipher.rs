//! Symmetric Primitives
//!
//! HKDF-SHA256 for turning an X25519 shared secret into an AES key, and
//! AES-256-GCM with a 96-bit IV and a 128-bit tag appended to the ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::keys::SharedSecret;
use super::CryptoError;

/// AES-256 key size, and the only HKDF output length this system uses
pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Salt used when the caller supplies none: one SHA-256 block of zeros.
/// Deterministic on purpose, so identical secrets always derive identical keys.
const ZERO_SALT: [u8; 32] = [0u8; 32];

/// HKDF-SHA256 extract-then-expand with an empty info string.
pub fn derive_key(
    shared_secret: &[u8],
    salt: Option<&[u8]>,
    length: usize,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if length == 0 {
        return Err(CryptoError::KeyDerivation(
            "output length must be at least 1 byte".to_string(),
        ));
    }

    let hk = Hkdf::<Sha256>::new(Some(salt.unwrap_or(&ZERO_SALT)), shared_secret);
    let mut okm = Zeroizing::new(vec![0u8; length]);
    hk.expand(&[], okm.as_mut_slice())
        .map_err(|e| CryptoError::KeyDerivation(format!("{} bytes requested: {}", length, e)))?;
    Ok(okm)
}

/// Message key for one ECDH result: `derive_key(shared, None, 32)`.
pub fn message_key(shared: &SharedSecret) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let okm = derive_key(shared.as_bytes(), None, KEY_LEN)?;
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&okm);
    Ok(key)
}

/// Fresh random IV from the OS random source
pub fn random_iv() -> Result<[u8; IV_LEN], CryptoError> {
    let mut iv = [0u8; IV_LEN];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|e| CryptoError::Entropy(e.to_string()))?;
    Ok(iv)
}

/// AES-256-GCM encrypt with empty associated data; the tag is appended.
pub fn encrypt(
    plaintext: &[u8],
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// AES-256-GCM decrypt. The tag is verified before any plaintext is released.
pub fn decrypt(
    ciphertext_with_tag: &[u8],
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext_with_tag)
        .map_err(|_| CryptoError::AuthenticationFailure)
}
