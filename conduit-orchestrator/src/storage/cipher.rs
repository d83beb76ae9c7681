//! AES-256-GCM envelope for stored artifacts
//!
//! Sealed layout: 12-byte random nonce followed by ciphertext and tag. The
//! caller supplies associated data binding the ciphertext to its location,
//! so a file copied under another key or version fails to open.

use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use conduit_core::StoreError;

const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

#[derive(Clone)]
pub struct ArtifactCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for ArtifactCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ArtifactCipher(..)")
    }
}

impl ArtifactCipher {
    pub fn new(key: &[u8]) -> Result<Self, StoreError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
            StoreError::Crypto(format!(
                "artifact key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            ))
        })?;
        Ok(Self { cipher })
    }

    /// Builds a cipher from a base64-encoded 32-byte key
    pub fn from_base64(encoded: &str) -> Result<Self, StoreError> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| StoreError::Crypto(format!("artifact key is not valid base64: {}", e)))?;
        Self::new(&key)
    }

    /// Generates a fresh random key, base64-encoded
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        STANDARD.encode(key)
    }

    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, StoreError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| StoreError::Crypto("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, StoreError> {
        if sealed.len() < NONCE_LEN {
            return Err(StoreError::Crypto("sealed artifact is truncated".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| {
                StoreError::Crypto("decryption failed (wrong key or tampered data)".to_string())
            })
    }
}
