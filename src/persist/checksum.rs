//! Content checksums of written artifacts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Suffix of the record key holding an artifact's secret digest.
pub const SECRET_SUFFIX: &str = "-secret";

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// Last successfully written digest per artifact.
///
/// A record only ever advances after the corresponding write succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    digests: BTreeMap<String, String>,
}

impl ChecksumRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.digests.get(key).map(String::as_str)
    }

    /// True when `digest` equals the recorded digest for `key`.
    pub fn matches(&self, key: &str, digest: &str) -> bool {
        self.get(key) == Some(digest)
    }

    pub fn advance(&mut self, key: impl Into<String>, digest: impl Into<String>) {
        self.digests.insert(key.into(), digest.into());
    }

    pub fn forget(&mut self, key: &str) {
        self.digests.remove(key);
    }

    /// Drop the records of `artifact`, its secret digest and any artifact
    /// nested under it (`cluster/alpha/acls`).
    pub fn forget_artifact(&mut self, artifact: &str) {
        let secret = format!("{}{}", artifact, SECRET_SUFFIX);
        let nested = format!("{}/", artifact);
        self.digests
            .retain(|k, _| k != artifact && *k != secret && !k.starts_with(&nested));
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}
