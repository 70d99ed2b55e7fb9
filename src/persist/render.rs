//! Artifact rendering.
//!
//! Each artifact is one `[section]` followed by `key = literal` lines sorted
//! by key. Secret lines carry ciphertext; their plaintext only feeds the
//! secret digest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fleet_settings::{SecretKind, SettingId, SettingValue};

use super::checksum::sha256_hex;
use crate::config::{
    cluster_snapshot_path, saved_cluster_section, ResolvedScope, GLOBAL_SECTION, IMMUTABLE_FILE,
    OVERWRITE_FILE, OVERWRITE_SECTION, SAVED_DEFAULT_FILE, SAVED_DEFAULT_SECTION,
};
use crate::vault::{parse_credentials, Cipher, CredentialEntry, VaultError};

pub const IMMUTABLE_ARTIFACT: &str = "immutable";
pub const SAVED_ARTIFACT: &str = "saved";
pub const OVERWRITE_ARTIFACT: &str = "overwrite";

/// Record key of a cluster's saved snapshot.
pub fn cluster_artifact(cluster: &str) -> String {
    format!("cluster/{}", cluster)
}

/// Live credential entries of each composite secret.
pub type LiveCredentials = BTreeMap<SettingId, Vec<CredentialEntry>>;

/// A rendered file ready for the checksum gate. `path` is relative to the
/// working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Checksum record key.
    pub name: String,
    pub path: PathBuf,
    pub body: String,
    pub plain_digest: String,
    pub secret_digest: String,
    /// Written on every save even when unchanged.
    pub rewrite: bool,
}

impl Artifact {
    /// An artifact without secret content.
    pub fn raw(name: impl Into<String>, path: PathBuf, body: String) -> Self {
        Self {
            name: name.into(),
            path,
            plain_digest: sha256_hex(&body),
            secret_digest: sha256_hex(""),
            body,
            rewrite: false,
        }
    }
}

#[derive(Debug)]
enum Line {
    Plain(String),
    Secret { stored: String, plaintext: String },
}

/// Collects lines of one section.
#[derive(Debug)]
struct SectionBuilder {
    section: String,
    lines: BTreeMap<String, Line>,
}

impl SectionBuilder {
    fn new(section: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            lines: BTreeMap::new(),
        }
    }

    fn plain(&mut self, key: &str, literal: String) {
        self.lines.insert(key.to_string(), Line::Plain(literal));
    }

    fn secret(&mut self, key: &str, stored: String, plaintext: String) {
        self.lines.insert(
            key.to_string(),
            Line::Secret {
                stored: toml::Value::String(stored).to_string(),
                plaintext,
            },
        );
    }

    fn has(&self, key: &str) -> bool {
        self.lines.contains_key(key)
    }

    fn build(self, name: impl Into<String>, path: PathBuf) -> Artifact {
        let header = format!("[{}]\n", toml_key(&self.section));
        let mut body = header.clone();
        let mut plain = header;
        let mut secret = String::new();
        for (key, line) in &self.lines {
            match line {
                Line::Plain(literal) => {
                    let text = format!("{} = {}\n", toml_key(key), literal);
                    body.push_str(&text);
                    plain.push_str(&text);
                }
                Line::Secret { stored, plaintext } => {
                    body.push_str(&format!("{} = {}\n", toml_key(key), stored));
                    secret.push_str(&format!("{}={}\n", key, plaintext));
                }
            }
        }
        Artifact {
            name: name.into(),
            path,
            body,
            plain_digest: sha256_hex(plain),
            secret_digest: sha256_hex(secret),
            rewrite: false,
        }
    }
}

/// Quote keys that are not bare TOML keys.
fn toml_key(key: &str) -> String {
    let bare = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if bare {
        key.to_string()
    } else {
        toml::Value::String(key.to_string()).to_string()
    }
}

/// Renders the artifacts of the global scope and of clusters.
pub struct Renderer<'a> {
    cipher: &'a Cipher,
    /// Live API users reported by the clusters, per composite setting.
    credentials: &'a LiveCredentials,
}

impl<'a> Renderer<'a> {
    pub fn new(cipher: &'a Cipher, credentials: &'a LiveCredentials) -> Self {
        Self { cipher, credentials }
    }

    fn live(&self, id: SettingId) -> &[CredentialEntry] {
        self.credentials.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `immutable.toml`: every key pinned at global scope plus extension keys.
    pub fn immutable(&self, global: &ResolvedScope) -> Result<Artifact, VaultError> {
        let mut section = SectionBuilder::new(GLOBAL_SECTION);
        for (id, value) in &global.snapshot.immutable {
            self.line(&mut section, global, *id, value, true)?;
        }
        for (key, value) in global.settings.extensions() {
            section.plain(key, value.to_string());
        }
        let mut artifact = section.build(IMMUTABLE_ARTIFACT, PathBuf::from(IMMUTABLE_FILE));
        artifact.rewrite = true;
        Ok(artifact)
    }

    /// `default.toml`: keys not pinned at global scope that differ from the
    /// compiled-in default.
    pub fn saved_default(&self, global: &ResolvedScope) -> Result<Artifact, VaultError> {
        let mut section = SectionBuilder::new(SAVED_DEFAULT_SECTION);
        let unpinned = || SettingId::all().filter(|id| !global.snapshot.is_immutable(*id));

        // Secrets straight from the vault; the generic pass skips them.
        for id in unpinned().filter(|id| id.is_secret()) {
            let plaintext = self.current_secret(global, id);
            if plaintext == default_string(id) {
                continue;
            }
            let stored = match id.secret_kind() {
                SecretKind::Composite => {
                    let entries = global.vault.composite_entries(id, self.live(id));
                    self.seal_entries(&entries)?
                }
                _ => match global.vault.encrypted_for_storage(id)? {
                    Some(stored) => stored,
                    None => self.cipher.seal(&plaintext)?,
                },
            };
            section.secret(id.name(), stored, plaintext);
        }

        for id in unpinned() {
            if section.has(id.name()) || id.is_secret() {
                continue;
            }
            if global.settings.differs_from_default(id) {
                section.plain(id.name(), global.settings.get(id).to_toml_literal());
            }
        }

        Ok(section.build(SAVED_ARTIFACT, PathBuf::from(SAVED_DEFAULT_FILE)))
    }

    /// `overwrite.toml`: promotions that differ from the value of the global
    /// file section.
    pub fn overwrite(&self, global: &ResolvedScope) -> Result<Artifact, VaultError> {
        let mut section = SectionBuilder::new(OVERWRITE_SECTION);
        for (id, value) in &global.snapshot.overrides {
            let base = global
                .base_values
                .get(id)
                .cloned()
                .unwrap_or_else(|| SettingValue::from(id.spec().default));
            if *value != base {
                self.line(&mut section, global, *id, value, false)?;
            }
        }
        Ok(section.build(OVERWRITE_ARTIFACT, PathBuf::from(OVERWRITE_FILE)))
    }

    /// `<cluster>/<cluster>.toml`: the dynamic map, audit entries included,
    /// restricted to values that differ from the compiled-in default.
    pub fn cluster(&self, scope: &ResolvedScope) -> Result<Artifact, VaultError> {
        let mut section = SectionBuilder::new(saved_cluster_section(&scope.name));
        for (id, value) in &scope.snapshot.dynamic {
            if *value == SettingValue::from(id.spec().default) {
                continue;
            }
            self.line(&mut section, scope, *id, value, false)?;
        }
        Ok(section.build(
            cluster_artifact(&scope.name),
            cluster_snapshot_path(Path::new(""), &scope.name),
        ))
    }

    fn line(
        &self,
        section: &mut SectionBuilder,
        scope: &ResolvedScope,
        id: SettingId,
        value: &SettingValue,
        live: bool,
    ) -> Result<(), VaultError> {
        match id.secret_kind() {
            SecretKind::Plain => section.plain(id.name(), value.to_toml_literal()),
            SecretKind::Secret => {
                let plaintext = value.to_string();
                section.secret(id.name(), self.cipher.seal(&plaintext)?, plaintext);
            }
            SecretKind::Composite => {
                let entries = if live {
                    scope.vault.composite_entries(id, self.live(id))
                } else {
                    parse_credentials(&value.to_string())
                };
                let plaintext = join_entries(&entries);
                section.secret(id.name(), self.seal_entries(&entries)?, plaintext);
            }
        }
        Ok(())
    }

    fn current_secret(&self, scope: &ResolvedScope, id: SettingId) -> String {
        match id.secret_kind() {
            SecretKind::Composite => join_entries(&scope.vault.composite_entries(id, self.live(id))),
            _ => scope
                .vault
                .decrypted(id)
                .unwrap_or_else(|| scope.settings.str(id).to_string()),
        }
    }

    fn seal_entries(&self, entries: &[CredentialEntry]) -> Result<String, VaultError> {
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(format!("{}:{}", entry.user, self.cipher.seal(&entry.password)?));
        }
        Ok(out.join(","))
    }
}

fn join_entries(entries: &[CredentialEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{}:{}", e.user, e.password))
        .collect::<Vec<_>>()
        .join(",")
}

fn default_string(id: SettingId) -> String {
    SettingValue::from(id.spec().default).to_string()
}
