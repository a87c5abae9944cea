//! Credential encryption and API-key material
//!
//! Uses AES-256-GCM for encrypting instance passwords at rest. Downstream
//! API keys are never stored; only their SHA-256 hash is.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use anyhow::{Result, anyhow};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// AES-256-GCM nonce size (96 bits = 12 bytes)
const NONCE_SIZE: usize = 12;
/// AES-256 key size (256 bits = 32 bytes)
const KEY_SIZE: usize = 32;
/// Raw length of a generated downstream API key, hex-encoded to 64 chars.
const API_KEY_BYTES: usize = 32;

/// Encryption service for instance credentials
#[derive(Clone)]
pub struct CredentialEncryption {
    cipher: Aes256Gcm,
}

impl CredentialEncryption {
    /// Create a new encryption service with the given key.
    ///
    /// The key should be 32 bytes; shorter keys are zero-padded.
    pub fn new(key: &[u8]) -> Result<Self> {
        let mut key_bytes = [0u8; KEY_SIZE];
        let len = key.len().min(KEY_SIZE);
        key_bytes[..len].copy_from_slice(&key[..len]);

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| anyhow!("failed to create cipher: {}", e))?;

        Ok(Self { cipher })
    }

    /// Create from a base64-encoded key (the form stored in config).
    pub fn from_base64_key(key_b64: &str) -> Result<Self> {
        let key = BASE64
            .decode(key_b64)
            .map_err(|e| anyhow!("invalid base64 key: {}", e))?;
        Self::new(&key)
    }

    /// Generate a random encryption key for initial setup.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }

    /// Encrypt a plaintext value.
    ///
    /// Returns `(ciphertext_base64, nonce_base64)`, stored in separate columns.
    pub fn encrypt(&self, plaintext: &str) -> Result<(String, String)> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("encryption failed: {}", e))?;

        Ok((BASE64.encode(&ciphertext), BASE64.encode(nonce_bytes)))
    }

    /// Decrypt an encrypted value given its nonce.
    pub fn decrypt(&self, ciphertext_b64: &str, nonce_b64: &str) -> Result<String> {
        let ciphertext = BASE64
            .decode(ciphertext_b64)
            .map_err(|e| anyhow!("invalid encrypted data: {}", e))?;
        let nonce_bytes = BASE64
            .decode(nonce_b64)
            .map_err(|e| anyhow!("invalid nonce: {}", e))?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(anyhow!(
                "invalid nonce length: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            ));
        }

        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|e| anyhow!("decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| anyhow!("invalid UTF-8 in plaintext: {}", e))
    }
}

impl std::fmt::Debug for CredentialEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialEncryption")
            .field("cipher", &"[REDACTED]")
            .finish()
    }
}

/// Generate a new downstream API key. The caller shows this to the operator
/// exactly once; only [hash_api_key] output is persisted.
pub fn generate_api_key() -> String {
    let mut raw = [0u8; API_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut raw);
    hex_encode(&raw)
}

/// SHA-256 hash of an API key, hex-encoded. This is the stored lookup key.
pub fn hash_api_key(key: &str) -> String {
    hex_encode(&Sha256::digest(key.as_bytes()))
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = CredentialEncryption::generate_key();
        let encryption = CredentialEncryption::from_base64_key(&key).unwrap();

        let plaintext = "my-qbittorrent-password";
        let (ciphertext, nonce) = encryption.encrypt(plaintext).unwrap();

        assert_ne!(ciphertext, plaintext);
        assert_eq!(encryption.decrypt(&ciphertext, &nonce).unwrap(), plaintext);
    }

    #[test]
    fn test_different_nonces() {
        let key = CredentialEncryption::generate_key();
        let encryption = CredentialEncryption::from_base64_key(&key).unwrap();

        let (c1, n1) = encryption.encrypt("same-value").unwrap();
        let (c2, n2) = encryption.encrypt("same-value").unwrap();

        assert_ne!(c1, c2);
        assert_ne!(n1, n2);
        assert_eq!(encryption.decrypt(&c1, &n1).unwrap(), "same-value");
        assert_eq!(encryption.decrypt(&c2, &n2).unwrap(), "same-value");
    }

    #[test]
    fn test_wrong_key_fails() {
        let e1 =
            CredentialEncryption::from_base64_key(&CredentialEncryption::generate_key()).unwrap();
        let e2 =
            CredentialEncryption::from_base64_key(&CredentialEncryption::generate_key()).unwrap();

        let (ciphertext, nonce) = e1.encrypt("secret").unwrap();
        assert!(e2.decrypt(&ciphertext, &nonce).is_err());
    }

    #[test]
    fn api_key_shape_and_hash_stability() {
        let key = generate_api_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));

        let h1 = hash_api_key(&key);
        let h2 = hash_api_key(&key);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, key);
    }
}
