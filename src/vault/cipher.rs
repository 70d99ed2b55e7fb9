//! AES-256-GCM sealing of secret values.
//!
//! Sealed values are rendered as `enc:<base64(nonce || ciphertext || tag)>`.
//! The ciphertext for a given plaintext is cached in memory so that saving an
//! unchanged secret twice produces byte-identical artifacts.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use base64::Engine;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;

use super::key::EncryptionKey;
use super::VaultError;

/// Prefix marking a sealed value in config artifacts.
pub const CIPHERTEXT_PREFIX: &str = "enc:";

const NONCE_LEN: usize = 12;

/// Symmetric cipher bound to the install key.
pub struct Cipher {
    aead: Aes256Gcm,
    sealed: Mutex<HashMap<Vec<u8>, String>>,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    pub fn new(key: &EncryptionKey) -> Self {
        Self {
            aead: Aes256Gcm::new(GenericArray::from_slice(key.as_bytes())),
            sealed: Mutex::new(HashMap::new()),
        }
    }

    /// Encrypt raw bytes with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .aead
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt bytes produced by [`Cipher::encrypt`].
    ///
    /// Fails explicitly on a wrong key or tampered data; never returns
    /// garbage plaintext.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, VaultError> {
        if data.len() < NONCE_LEN {
            return Err(VaultError::Decryption("data too short".to_string()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.aead
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| VaultError::Decryption("authentication failed".to_string()))
    }

    /// Seal a plaintext string for storage.
    pub fn seal(&self, plaintext: &str) -> Result<String, VaultError> {
        if let Some(sealed) = self.cached(plaintext.as_bytes()) {
            return Ok(sealed);
        }
        let data = self.encrypt(plaintext.as_bytes())?;
        let sealed = format!(
            "{}{}",
            CIPHERTEXT_PREFIX,
            base64::engine::general_purpose::STANDARD.encode(data)
        );
        self.remember(plaintext.as_bytes(), &sealed);
        Ok(sealed)
    }

    /// Open a sealed string read from storage.
    pub fn open(&self, sealed: &str) -> Result<String, VaultError> {
        let encoded = sealed
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or_else(|| VaultError::Decryption("missing ciphertext prefix".to_string()))?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::Decryption(format!("invalid base64: {}", e)))?;
        let plaintext = self.decrypt(&data)?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| VaultError::Decryption("plaintext is not UTF-8".to_string()))?;
        // Keep the stored form so an untouched secret is rewritten identically.
        self.remember(plaintext.as_bytes(), sealed);
        Ok(plaintext)
    }

    /// True when `value` carries the sealed prefix.
    pub fn is_sealed(value: &str) -> bool {
        value.starts_with(CIPHERTEXT_PREFIX)
    }

    /// Drop the cached sealed form of a retired plaintext.
    pub fn forget(&self, plaintext: &str) {
        if let Ok(mut cache) = self.sealed.lock() {
            cache.remove(plaintext.as_bytes());
        }
    }

    fn cached(&self, plaintext: &[u8]) -> Option<String> {
        self.sealed.lock().ok()?.get(plaintext).cloned()
    }

    fn remember(&self, plaintext: &[u8], sealed: &str) {
        if let Ok(mut cache) = self.sealed.lock() {
            cache.insert(plaintext.to_vec(), sealed.to_string());
        }
    }
}
