//! Per-install encryption key file.

use rand::RngCore;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{info, warn};

/// Key file name inside the working directory.
pub const KEY_FILE_NAME: &str = ".fleet.key";

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// Symmetric key used to seal secrets at rest.
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// How the key was obtained at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    /// Loaded from an existing key file.
    Loaded,
    /// No key file existed; a new one was generated.
    Generated,
    /// A key file existed but could not be used; a new key replaced it and
    /// previously encrypted values are unreadable.
    Replaced,
}

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Parse the hex encoded key file content.
    pub fn from_hex(text: &str) -> Result<Self, String> {
        let bytes = hex::decode(text.trim()).map_err(|e| format!("invalid hex: {}", e))?;
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("expected {} bytes, got {}", KEY_LEN, v.len()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Load the key from `path`, generating and writing a new one when it is
    /// missing or unusable.
    ///
    /// A replaced key is logged as a warning: values sealed under the old key
    /// can no longer be opened and must be entered again.
    pub fn load_or_generate(path: &Path) -> io::Result<(Self, KeyOrigin)> {
        let origin = match fs::read_to_string(path) {
            Ok(text) => match Self::from_hex(&text) {
                Ok(key) => return Ok((key, KeyOrigin::Loaded)),
                Err(reason) => {
                    warn!(
                        path = %path.display(),
                        %reason,
                        "encryption key unusable, generating a new one; previously encrypted values are now unreadable and must be re-entered"
                    );
                    KeyOrigin::Replaced
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => KeyOrigin::Generated,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "encryption key unreadable, generating a new one; previously encrypted values are now unreadable and must be re-entered"
                );
                KeyOrigin::Replaced
            }
        };

        let key = Self::generate();
        key.write_to(path)?;
        if origin == KeyOrigin::Generated {
            info!(path = %path.display(), "generated new encryption key");
        }
        Ok((key, origin))
    }

    fn write_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_hex())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}
