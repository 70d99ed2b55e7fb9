//! SecretVault: secret values with change tracking and at-rest sealing.
//!
//! Plaintext only lives in memory. Every path to disk goes through
//! [`SecretVault::encrypted_for_storage`] or
//! [`SecretVault::encrypted_composite`], which return `enc:` ciphertext.

mod cipher;
mod key;

pub use cipher::{Cipher, CIPHERTEXT_PREFIX};
pub use key::{EncryptionKey, KeyOrigin, KEY_FILE_NAME, KEY_LEN};

use base64::Engine;
use fleet_settings::{SecretKind, SettingId};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors from secret handling.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Wire value was not valid base64 or not UTF-8. Nothing was mutated.
    #[error("unable to decode {key}: {reason}")]
    BadInput { key: String, reason: String },

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("{0} is not a secret setting")]
    NotSecret(SettingId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Current and previous value of one secret.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret {
    pub value: String,
    pub old_value: String,
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("value", &"[REDACTED]")
            .field("changed", &self.changed())
            .finish()
    }
}

impl Secret {
    /// A secret loaded from storage has no pending change.
    pub fn stored(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            old_value: value.clone(),
            value,
        }
    }

    /// True when the value was replaced since it was loaded.
    pub fn changed(&self) -> bool {
        !self.old_value.is_empty() && self.value != self.old_value
    }

    /// Shift the current value into `old_value` and store `value`.
    pub fn rotate(&mut self, value: impl Into<String>) {
        self.old_value = std::mem::replace(&mut self.value, value.into());
    }
}

/// One API credential entry of a composite secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialEntry {
    pub user: String,
    pub password: String,
}

/// Decode a base64 wire value into UTF-8 plaintext.
pub fn decode_wire(key: SettingId, encoded: &str) -> Result<String, VaultError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| VaultError::BadInput {
            key: key.name().to_string(),
            reason: e.to_string(),
        })?;
    String::from_utf8(bytes).map_err(|_| VaultError::BadInput {
        key: key.name().to_string(),
        reason: "value is not UTF-8".to_string(),
    })
}

/// Parse a `user:password,user2:password2` credential list.
pub fn parse_credentials(raw: &str) -> Vec<CredentialEntry> {
    fleet_settings::split_list(raw)
        .into_iter()
        .map(|entry| match entry.split_once(':') {
            Some((user, password)) => CredentialEntry {
                user: user.to_string(),
                password: password.to_string(),
            },
            None => CredentialEntry {
                user: entry,
                password: String::new(),
            },
        })
        .collect()
}

/// Secrets of one scope (global or a single cluster).
#[derive(Debug, Clone)]
pub struct SecretVault {
    cipher: Arc<Cipher>,
    secrets: BTreeMap<SettingId, Secret>,
}

impl SecretVault {
    pub fn new(cipher: Arc<Cipher>) -> Self {
        Self {
            cipher,
            secrets: BTreeMap::new(),
        }
    }

    pub fn cipher(&self) -> &Arc<Cipher> {
        &self.cipher
    }

    /// Load a value read from a config source.
    ///
    /// Ciphertext is opened; plaintext entered by an operator is accepted
    /// as-is and sealed on the next save. Composite values are handled entry
    /// by entry. Returns the plaintext.
    pub fn load_stored(&mut self, id: SettingId, stored: &str) -> Result<String, VaultError> {
        let plaintext = match id.secret_kind() {
            SecretKind::Plain => return Err(VaultError::NotSecret(id)),
            SecretKind::Secret => self.open_value(stored)?,
            SecretKind::Composite => {
                let mut entries = Vec::new();
                for entry in parse_credentials(stored) {
                    let password = self.open_value(&entry.password)?;
                    entries.push(format!("{}:{}", entry.user, password));
                }
                entries.join(",")
            }
        };
        self.secrets.insert(id, Secret::stored(plaintext.clone()));
        Ok(plaintext)
    }

    fn open_value(&self, stored: &str) -> Result<String, VaultError> {
        if Cipher::is_sealed(stored) {
            self.cipher.open(stored)
        } else {
            Ok(stored.to_string())
        }
    }

    /// Set a secret from its base64 wire form.
    ///
    /// Malformed input returns [`VaultError::BadInput`] and leaves the vault
    /// untouched.
    pub fn set_secret(&mut self, id: SettingId, encoded: &str) -> Result<String, VaultError> {
        let plaintext = decode_wire(id, encoded)?;
        self.set_plaintext(id, plaintext.clone())?;
        Ok(plaintext)
    }

    /// Set a secret from plaintext, shifting the previous value.
    pub fn set_plaintext(&mut self, id: SettingId, plaintext: impl Into<String>) -> Result<(), VaultError> {
        if !id.is_secret() {
            return Err(VaultError::NotSecret(id));
        }
        let secret = self.secrets.entry(id).or_default();
        secret.rotate(plaintext);
        if !secret.old_value.is_empty() && secret.old_value != secret.value {
            match id.secret_kind() {
                SecretKind::Composite => {
                    let current = parse_credentials(&secret.value);
                    for entry in parse_credentials(&secret.old_value) {
                        if !current.iter().any(|c| c.password == entry.password) {
                            self.cipher.forget(&entry.password);
                        }
                    }
                }
                _ => self.cipher.forget(&secret.old_value),
            }
        }
        Ok(())
    }

    pub fn secret(&self, id: SettingId) -> Option<&Secret> {
        self.secrets.get(&id)
    }

    pub fn decrypted(&self, id: SettingId) -> Option<String> {
        self.secrets.get(&id).map(|s| s.value.clone())
    }

    /// Ciphertext of the current value, `None` when the secret is unset.
    pub fn encrypted_for_storage(&self, id: SettingId) -> Result<Option<String>, VaultError> {
        match self.secrets.get(&id) {
            Some(secret) => self.cipher.seal(&secret.value).map(Some),
            None => Ok(None),
        }
    }

    /// Render a composite credential list as `user:<ciphertext>` entries.
    ///
    /// Entries without a live password fall back to the password currently
    /// stored for the same user.
    pub fn encrypted_composite(
        &self,
        id: SettingId,
        live: &[CredentialEntry],
    ) -> Result<String, VaultError> {
        let entries = self.composite_entries(id, live);
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(format!("{}:{}", entry.user, self.cipher.seal(&entry.password)?));
        }
        Ok(out.join(","))
    }

    /// Plaintext composite entries after applying the stored fallback.
    pub fn composite_entries(&self, id: SettingId, live: &[CredentialEntry]) -> Vec<CredentialEntry> {
        let stored = self
            .secrets
            .get(&id)
            .map(|s| parse_credentials(&s.value))
            .unwrap_or_default();
        if live.is_empty() {
            return stored;
        }
        live.iter()
            .map(|entry| {
                let password = if entry.password.is_empty() {
                    stored
                        .iter()
                        .find(|s| s.user == entry.user)
                        .map(|s| s.password.clone())
                        .unwrap_or_default()
                } else {
                    entry.password.clone()
                };
                CredentialEntry {
                    user: entry.user.clone(),
                    password,
                }
            })
            .collect()
    }

    pub fn insert(&mut self, id: SettingId, secret: Secret) {
        self.secrets.insert(id, secret);
    }

    pub fn iter(&self) -> impl Iterator<Item = (SettingId, &Secret)> {
        self.secrets.iter().map(|(id, s)| (*id, s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> SecretVault {
        SecretVault::new(Arc::new(Cipher::new(&EncryptionKey::generate())))
    }

    #[test]
    fn test_set_secret_decodes_base64() {
        let mut vault = vault();
        let plaintext = vault.set_secret(SettingId::MailSmtpPassword, "cGFzczE=").unwrap();
        assert_eq!(plaintext, "pass1");
        assert_eq!(vault.decrypted(SettingId::MailSmtpPassword).as_deref(), Some("pass1"));
    }

    #[test]
    fn test_malformed_wire_value_is_rejected_without_mutation() {
        let mut vault = vault();
        vault.set_plaintext(SettingId::MailSmtpPassword, "pass1").unwrap();

        let err = vault.set_secret(SettingId::MailSmtpPassword, "%%%").unwrap_err();
        assert!(matches!(err, VaultError::BadInput { .. }));
        assert!(err.to_string().starts_with("unable to decode"));
        assert_eq!(vault.decrypted(SettingId::MailSmtpPassword).as_deref(), Some("pass1"));

        // valid base64 but not UTF-8
        assert!(vault.set_secret(SettingId::MailSmtpPassword, "/w==").is_err());
    }

    #[test]
    fn test_rotation_tracks_old_value() {
        let mut vault = vault();
        vault.load_stored(SettingId::GitAccessToken, "tok-1").unwrap();
        assert!(!vault.secret(SettingId::GitAccessToken).unwrap().changed());

        vault.set_plaintext(SettingId::GitAccessToken, "tok-2").unwrap();
        let secret = vault.secret(SettingId::GitAccessToken).unwrap();
        assert_eq!(secret.value, "tok-2");
        assert_eq!(secret.old_value, "tok-1");
        assert!(secret.changed());
    }

    #[test]
    fn test_first_set_is_not_a_change() {
        let mut vault = vault();
        vault.set_plaintext(SettingId::VaultToken, "t").unwrap();
        assert!(!vault.secret(SettingId::VaultToken).unwrap().changed());
    }

    #[test]
    fn test_plain_setting_is_not_a_secret() {
        let mut vault = vault();
        assert!(matches!(
            vault.set_plaintext(SettingId::FailoverLimit, "3"),
            Err(VaultError::NotSecret(SettingId::FailoverLimit))
        ));
    }

    #[test]
    fn test_storage_form_is_ciphertext() {
        let mut vault = vault();
        vault.set_plaintext(SettingId::MailSmtpPassword, "pass1").unwrap();
        let stored = vault
            .encrypted_for_storage(SettingId::MailSmtpPassword)
            .unwrap()
            .unwrap();
        assert!(stored.starts_with(CIPHERTEXT_PREFIX));
        assert!(!stored.contains("pass1"));

        let mut reloaded = SecretVault::new(vault.cipher().clone());
        assert_eq!(reloaded.load_stored(SettingId::MailSmtpPassword, &stored).unwrap(), "pass1");
        assert!(vault.encrypted_for_storage(SettingId::VaultToken).unwrap().is_none());
    }

    #[test]
    fn test_composite_falls_back_to_stored_password() {
        let mut vault = vault();
        vault
            .load_stored(SettingId::ApiCredentials, "admin:changeme,ops:opspw")
            .unwrap();

        let live = vec![
            CredentialEntry { user: "admin".into(), password: "newpw".into() },
            CredentialEntry { user: "ops".into(), password: String::new() },
        ];
        let entries = vault.composite_entries(SettingId::ApiCredentials, &live);
        assert_eq!(entries[0].password, "newpw");
        assert_eq!(entries[1].password, "opspw");

        let stored = vault.encrypted_composite(SettingId::ApiCredentials, &live).unwrap();
        assert!(stored.starts_with("admin:enc:"));
        assert!(!stored.contains("opspw"));

        let mut reloaded = SecretVault::new(vault.cipher().clone());
        assert_eq!(
            reloaded.load_stored(SettingId::ApiCredentials, &stored).unwrap(),
            "admin:newpw,ops:opspw"
        );
    }

    #[test]
    fn test_secret_debug_redacts() {
        let secret = Secret::stored("pass1");
        assert!(!format!("{:?}", secret).contains("pass1"));
    }
}
