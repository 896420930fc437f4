//! AES-256-GCM encryption for individual secret strings.
//!
//! Each call draws a fresh random nonce, so encrypting the same token twice
//! yields different ciphertext. The stored form is `base64(nonce || ciphertext)`
//! where the ciphertext carries the GCM authentication tag.

use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

/// Symmetric authenticated encryption of secret strings.
///
/// The empty string maps to the empty string in both directions, so an absent
/// secret never round-trips through the cipher.
#[derive(Clone)]
pub struct Encryptor {
    cipher: Aes256Gcm,
}

impl Encryptor {
    /// Builds an encryptor from raw key material.
    ///
    /// # Returns
    /// * `Err(Error::InvalidKeySize)` - unless `key` is exactly 32 bytes
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(Error::InvalidKeySize(key.len()));
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| Error::InvalidKeySize(key.len()))?;
        Ok(Self { cipher })
    }

    /// Encrypts `plaintext` with a random nonce and returns base64 text.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        // Never reuse a nonce with the same key
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| Error::DecryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    /// Decrypts base64 text produced by [`Encryptor::encrypt`].
    ///
    /// # Returns
    /// * `Err(Error::CiphertextTooShort)` - input shorter than the nonce
    /// * `Err(Error::DecryptionFailed)` - tampered data, wrong key, or bad encoding
    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }

        let bytes = BASE64
            .decode(ciphertext)
            .map_err(|_| Error::DecryptionFailed)?;
        if bytes.len() < NONCE_SIZE {
            return Err(Error::CiphertextTooShort {
                expected: NONCE_SIZE,
                actual: bytes.len(),
            });
        }

        let (nonce, sealed) = bytes.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| Error::DecryptionFailed)
    }
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor").finish_non_exhaustive()
    }
}
