//! At-rest encryption for stored provider credentials.
//!
//! AES-256-GCM with a key derived as SHA-256 of the configured secret.
//! Stored form: `base64(nonce || ciphertext)` with a fresh 96-bit nonce
//! per value.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Errors from encrypting or decrypting a stored credential.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid encryption key")]
    InvalidKey,

    #[error("encryption failed")]
    Encrypt,

    #[error("stored credential is not valid base64")]
    Encoding,

    #[error("stored credential is truncated")]
    Truncated,

    #[error("stored credential could not be decrypted (wrong key or corrupted data)")]
    Decrypt,
}

/// Cipher bound to one configured secret.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher(..)")
    }
}

impl TokenCipher {
    /// Derive the key from `secret`.
    pub fn from_secret(secret: &str) -> Result<Self, CryptoError> {
        let key = Sha256::digest(secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut stored = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        stored.extend_from_slice(&nonce_bytes);
        stored.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(stored))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        let raw = STANDARD
            .decode(stored.trim())
            .map_err(|_| CryptoError::Encoding)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt)
    }
}
