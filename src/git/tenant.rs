//! Tenant files pulled into `.pull/`.
//!
//! `terms.txt`, `peer.json` and `partners.json` are reloaded only when
//! their content checksum changes.

use serde_json::Value;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{info, warn};

use crate::persist::{sha256_hex, write_atomic, ChecksumRecord};
use crate::vault::KEY_FILE_NAME;

/// Directory holding the tenant pull repository.
pub const PULL_DIR: &str = ".pull";

const TERMS_FILE: &str = "terms.txt";
const PEER_FILE: &str = "peer.json";
const PARTNERS_FILE: &str = "partners.json";

/// Which tenant files changed on the last reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantUpdate {
    pub terms: bool,
    pub peers: bool,
    pub partners: bool,
}

impl TenantUpdate {
    pub fn any(&self) -> bool {
        self.terms || self.peers || self.partners
    }
}

/// Last loaded tenant documents.
#[derive(Debug, Clone, Default)]
pub struct TenantFiles {
    record: ChecksumRecord,
    pub terms: String,
    pub peers: Vec<Value>,
    pub partners: Vec<Value>,
}

impl TenantFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reload whichever files changed since the last call.
    pub fn reload(&mut self, pull_dir: &Path) -> TenantUpdate {
        let mut update = TenantUpdate::default();

        if let Some(text) = self.changed(pull_dir, TERMS_FILE, "terms") {
            self.terms = text;
            update.terms = true;
        }
        if let Some(text) = self.changed(pull_dir, PEER_FILE, "peer") {
            match parse_list(&text) {
                Ok(list) => {
                    self.peers = list;
                    update.peers = true;
                }
                Err(e) => warn!(file = PEER_FILE, error = %e, "ignoring invalid tenant file"),
            }
        }
        if let Some(text) = self.changed(pull_dir, PARTNERS_FILE, "partners") {
            match parse_list(&text) {
                Ok(list) => {
                    self.partners = list;
                    update.partners = true;
                }
                Err(e) => warn!(file = PARTNERS_FILE, error = %e, "ignoring invalid tenant file"),
            }
        }

        if update.any() {
            info!(?update, "tenant files reloaded");
        }
        update
    }

    fn changed(&mut self, dir: &Path, file: &str, key: &str) -> Option<String> {
        let text = fs::read_to_string(dir.join(file)).ok()?;
        let digest = sha256_hex(&text);
        if self.record.matches(key, &digest) {
            return None;
        }
        self.record.advance(key, digest);
        Some(text)
    }
}

fn parse_list(text: &str) -> Result<Vec<Value>, serde_json::Error> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => Ok(items),
        other => Ok(vec![other]),
    }
}

/// Make sure `.gitignore` in `dir` lists the tenant pull directory and the
/// encryption key. Returns true when the file was modified.
pub fn ensure_gitignore(dir: &Path) -> io::Result<bool> {
    let path = dir.join(".gitignore");
    let existing = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let pull_entry = format!("{}/", PULL_DIR);
    let missing: Vec<&str> = [pull_entry.as_str(), KEY_FILE_NAME]
        .into_iter()
        .filter(|entry| {
            !existing
                .lines()
                .any(|l| l.trim().trim_end_matches('/') == entry.trim_end_matches('/'))
        })
        .collect();
    if missing.is_empty() {
        return Ok(false);
    }

    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    for entry in missing {
        updated.push_str(entry);
        updated.push('\n');
    }
    write_atomic(&path, updated.as_bytes())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reload_only_on_change() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("terms.txt"), "v1").unwrap();
        fs::write(dir.path().join("peer.json"), r#"[{"host":"10.0.0.1:10001"}]"#).unwrap();

        let mut tenant = TenantFiles::new();
        let first = tenant.reload(dir.path());
        assert!(first.terms && first.peers && !first.partners);
        assert_eq!(tenant.peers.len(), 1);

        assert!(!tenant.reload(dir.path()).any());

        fs::write(dir.path().join("terms.txt"), "v2").unwrap();
        let third = tenant.reload(dir.path());
        assert_eq!(third, TenantUpdate { terms: true, peers: false, partners: false });
        assert_eq!(tenant.terms, "v2");
    }

    #[test]
    fn test_invalid_json_keeps_previous() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("partners.json"), "[1,2]").unwrap();
        let mut tenant = TenantFiles::new();
        tenant.reload(dir.path());
        assert_eq!(tenant.partners.len(), 2);

        fs::write(dir.path().join("partners.json"), "{broken").unwrap();
        assert!(!tenant.reload(dir.path()).partners);
        assert_eq!(tenant.partners.len(), 2);
    }

    #[test]
    fn test_gitignore_lists_pull_dir_and_key_once() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".gitignore"), "*.tmp").unwrap();
        assert!(ensure_gitignore(dir.path()).unwrap());
        assert!(!ensure_gitignore(dir.path()).unwrap());
        assert_eq!(
            fs::read_to_string(dir.path().join(".gitignore")).unwrap(),
            "*.tmp\n.pull/\n.fleet.key\n"
        );
    }
}
