//! AES-256-GCM encryption for records at rest
//!
//! Ciphertexts are stored as base64(nonce || ciphertext || tag). The key is the
//! SHA-256 digest of an operational secret, so any secret length is accepted.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

use crate::error::{Result, TriageError};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Derive the cipher key from an operational secret
    pub fn from_secret(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(TriageError::ConfigError(
                "encryption secret must not be empty".to_string(),
            ));
        }
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| TriageError::Crypto(format!("encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// Decrypt and verify integrity; tampered or foreign ciphertexts fail
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| TriageError::Crypto(format!("invalid ciphertext encoding: {}", e)))?;

        if bytes.len() <= NONCE_LEN {
            return Err(TriageError::Crypto("ciphertext too short".to_string()));
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TriageError::Crypto("integrity check failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| TriageError::Crypto(format!("plaintext is not UTF-8: {}", e)))
    }
}
