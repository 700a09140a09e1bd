//! Authenticated encryption for task payloads and results at rest.
//!
//! AES-256-GCM with a fresh 96-bit random nonce per message. The wire format
//! is `nonce (12 bytes) || ciphertext || tag (16 bytes)`. Decryption verifies
//! the tag, so a wrong key or a flipped bit yields [`DecryptionError`] rather
//! than garbage plaintext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use std::fmt;
use thiserror::Error;

/// Key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Plaintext exceeds the AES-GCM message length limit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("encryption failed: plaintext of {len} bytes exceeds the AES-GCM limit")]
pub struct EncryptionError {
    pub len: usize,
}

/// Ciphertext could not be authenticated with the configured key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("decryption failed: {reason}")]
pub struct DecryptionError {
    pub reason: &'static str,
}

/// A process-wide 256-bit secret. Never serialised; `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a standard-alphabet base64 string holding exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, String> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| format!("encryption key is not valid base64: {e}"))?;
        let bytes: [u8; KEY_LEN] = raw.try_into().map_err(|v: Vec<u8>| {
            format!("encryption key must be {KEY_LEN} bytes, got {}", v.len())
        })?;
        Ok(Self(bytes))
    }

    /// Generate a random key from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Encrypt/decrypt pairs bound to one key.
#[derive(Clone)]
pub struct Codec {
    cipher: Aes256Gcm,
}

impl Codec {
    pub fn new(key: &EncryptionKey) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&key.0);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| EncryptionError {
                len: plaintext.len(),
            })?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(DecryptionError {
                reason: "ciphertext too short",
            });
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| DecryptionError {
                reason: "authentication tag mismatch (wrong key or tampered data)",
            })
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Codec(aes-256-gcm)")
    }
}

/// One-shot encrypt with `key`.
pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, EncryptionError> {
    Codec::new(key).encrypt(plaintext)
}

/// One-shot decrypt with `key`.
pub fn decrypt(ciphertext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, DecryptionError> {
    Codec::new(key).decrypt(ciphertext)
}
