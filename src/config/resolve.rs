//! LayeredResolver: per-scope resolution with Immutable/Dynamic
//! classification.
//!
//! Layers, lowest precedence first:
//!
//! 1. compiled-in defaults
//! 2. `[Default]` of the main file and include files (immutable)
//! 3. `[overwrite-default]` promotions (immutable)
//! 4. `[<cluster>]` sections (immutable, cluster scope only)
//! 5. `[saved-default]` then `[saved-<cluster>]` (dynamic, only when
//!    `monitoring-save-config` is on, never over an immutable key)
//! 6. command line overrides (immutable)

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use fleet_settings::{Handler, Registry, SettingError, SettingId, SettingValue, Settings};

use super::snapshot::ConfigSnapshot;
use super::source::{
    saved_cluster_section, ConfigSource, ConfigSources, GLOBAL_SECTION, OVERWRITE_SECTION,
    SAVED_DEFAULT_SECTION,
};
use crate::vault::{Cipher, Secret, SecretVault};

/// Name of the global scope in logs and reports.
pub const GLOBAL_SCOPE: &str = "global";

/// Placeholder shown instead of secret values.
pub const REDACTED: &str = "[REDACTED]";

/// Resolved configuration of one scope.
#[derive(Debug, Clone)]
pub struct ResolvedScope {
    pub name: String,
    pub settings: Settings,
    pub snapshot: ConfigSnapshot,
    pub vault: SecretVault,
    pub sources: Vec<ConfigSource>,
    /// Values pinned by this scope's own file section: `[Default]` for the
    /// global scope, `[<cluster>]` for a cluster.
    pub base_values: BTreeMap<SettingId, SettingValue>,
    /// Keys pinned on the command line.
    pub cli_keys: BTreeSet<SettingId>,
}

impl ResolvedScope {
    fn new(name: &str, cipher: Arc<Cipher>) -> Self {
        Self {
            name: name.to_string(),
            settings: Settings::defaults(),
            snapshot: ConfigSnapshot::default(),
            vault: SecretVault::new(cipher),
            sources: vec![ConfigSource::builtin()],
            base_values: BTreeMap::new(),
            cli_keys: BTreeSet::new(),
        }
    }

    /// True when a promoted global value may replace this scope's value.
    pub fn accepts_override(&self, id: SettingId) -> bool {
        !self.base_values.contains_key(&id) && !self.cli_keys.contains(&id)
    }

    /// Effective configuration with secret values replaced.
    pub fn redacted(&self) -> BTreeMap<String, toml::Value> {
        let mut out = BTreeMap::new();
        for (id, value) in self.settings.iter() {
            let rendered = if id.is_secret() {
                toml::Value::String(REDACTED.to_string())
            } else {
                to_toml(value)
            };
            out.insert(id.name().to_string(), rendered);
        }
        for (key, value) in self.settings.extensions() {
            out.insert(key.clone(), value.clone());
        }
        out
    }

    fn read(&mut self, handler: &Handler, raw: &toml::Value) -> Result<SettingValue, SettingError> {
        let id = handler.id();
        if !handler.is_secret() {
            return handler.validate_toml(raw);
        }
        let stored = raw
            .as_str()
            .ok_or_else(|| SettingError::bad_input(id.name(), "secret must be a string"))?;
        let plaintext = self
            .vault
            .load_stored(id, stored)
            .map_err(|e| SettingError::bad_input(id.name(), e.to_string()))?;
        handler.validate(&plaintext)
    }

    fn apply(&mut self, handler: &Handler, value: SettingValue) -> SettingValue {
        handler.apply(&mut self.settings, value);
        self.settings.get(handler.id()).clone()
    }

    fn finish(mut self) -> Self {
        // Every secret gets a vault entry, defaults included.
        for id in SettingId::all().filter(|id| id.is_secret()) {
            if self.vault.secret(id).is_none() {
                self.vault
                    .insert(id, Secret::stored(self.settings.str(id).to_string()));
            }
        }
        self.snapshot.init = self.settings.clone();
        self
    }
}

/// Which layer a static table is applied as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StaticLayer {
    Global,
    Override,
    Cluster,
    Cli,
}

/// Resolves the global scope and each cluster from a set of sources.
pub struct LayeredResolver<'a> {
    registry: &'a Registry,
    sources: &'a ConfigSources,
    cipher: Arc<Cipher>,
}

impl<'a> LayeredResolver<'a> {
    pub fn new(registry: &'a Registry, sources: &'a ConfigSources, cipher: Arc<Cipher>) -> Self {
        Self {
            registry,
            sources,
            cipher,
        }
    }

    pub fn resolve_global(&self) -> ResolvedScope {
        let mut scope = ResolvedScope::new(GLOBAL_SCOPE, self.cipher.clone());
        self.apply_global_layers(&mut scope);

        if self.saving_enabled(&scope.settings) {
            if let Some(file) = self.sources.saved_default() {
                if let Some(table) = file.section(SAVED_DEFAULT_SECTION) {
                    scope.sources.push(file.source.clone());
                    self.apply_saved(&mut scope, table, true, false);
                }
            }
        }

        self.apply_cli(&mut scope);
        scope.finish()
    }

    pub fn resolve_cluster(&self, cluster: &str) -> ResolvedScope {
        let mut scope = ResolvedScope::new(cluster, self.cipher.clone());
        self.apply_global_layers(&mut scope);

        // The pseudo-cluster's section is `[Default]`, already applied above.
        if cluster != GLOBAL_SECTION {
            let mut found = false;
            for file in self.sources.global_files() {
                if let Some(table) = file.section(cluster) {
                    found = true;
                    scope.sources.push(file.source.clone());
                    self.apply_static(&mut scope, table, StaticLayer::Cluster);
                }
            }
            if !found {
                warn!(cluster = %cluster, "no configuration section for cluster, using global values");
            }
        }

        if self.saving_enabled(&scope.settings) {
            if let Some(file) = self.sources.saved_default() {
                if let Some(table) = file.section(SAVED_DEFAULT_SECTION) {
                    scope.sources.push(file.source.clone());
                    self.apply_saved(&mut scope, table, false, true);
                }
            }
            if let Some(file) = self.sources.saved_cluster(cluster) {
                if let Some(table) = file.section(&saved_cluster_section(cluster)) {
                    scope.sources.push(file.source.clone());
                    self.apply_saved(&mut scope, table, true, true);
                }
            }
        }

        self.apply_cli(&mut scope);
        scope.finish()
    }

    fn apply_global_layers(&self, scope: &mut ResolvedScope) {
        let mut found = false;
        for file in self.sources.global_files() {
            if let Some(table) = file.section(GLOBAL_SECTION) {
                found = true;
                scope.sources.push(file.source.clone());
                self.apply_static(scope, table, StaticLayer::Global);
            }
        }
        if !found {
            debug!(scope = %scope.name, "no [Default] section found");
        }

        if let Some(file) = self.sources.overwrite() {
            if let Some(table) = file.section(OVERWRITE_SECTION) {
                scope.sources.push(file.source.clone());
                self.apply_static(scope, table, StaticLayer::Override);
            }
        }
    }

    /// Saved values are applied only when dynamic persistence is on and the
    /// operator did not ask to restore the static configuration.
    fn saving_enabled(&self, settings: &Settings) -> bool {
        let cli = |id: SettingId| {
            self.sources
                .cli()
                .iter()
                .rev()
                .find(|(k, _)| SettingId::from_name(k) == Some(id))
                .and_then(|(_, v)| SettingValue::parse(id.spec().kind, v).ok())
                .and_then(|v| v.as_bool())
        };
        let save = cli(SettingId::MonitoringSaveConfig).unwrap_or_else(|| settings.save_config());
        let restore = cli(SettingId::MonitoringRestoreConfigOnStart)
            .unwrap_or_else(|| settings.bool(SettingId::MonitoringRestoreConfigOnStart));
        save && !restore
    }

    fn apply_static(&self, scope: &mut ResolvedScope, table: &toml::Table, layer: StaticLayer) {
        let cluster_target = layer == StaticLayer::Cluster;
        for (key, raw) in table {
            if raw.is_table() {
                continue;
            }
            let handler = match self.registry.lookup(key) {
                Ok(handler) => *handler,
                Err(_) => {
                    debug!(scope = %scope.name, key = %key, "keeping extension key");
                    scope.settings.set_extension(key.clone(), raw.clone());
                    continue;
                }
            };
            if let Err(e) = handler.check_scope(cluster_target) {
                warn!(scope = %scope.name, error = %e, "ignoring setting");
                continue;
            }
            let value = match scope.read(&handler, raw) {
                Ok(value) => value,
                Err(e) => {
                    warn!(scope = %scope.name, error = %e, "ignoring invalid setting");
                    continue;
                }
            };

            let id = handler.id();
            let value = scope.apply(&handler, value);
            match layer {
                StaticLayer::Override => scope.snapshot.record_override(id, value),
                StaticLayer::Global if scope.name == GLOBAL_SCOPE => {
                    scope.base_values.insert(id, value.clone());
                    scope.snapshot.record_immutable(id, value);
                }
                StaticLayer::Cluster => {
                    scope.base_values.insert(id, value.clone());
                    scope.snapshot.overrides.remove(&id);
                    scope.snapshot.record_immutable(id, value);
                }
                StaticLayer::Cli => {
                    scope.cli_keys.insert(id);
                    // The global scope keeps its promotions for the overwrite artifact.
                    if scope.name != GLOBAL_SCOPE {
                        scope.snapshot.overrides.remove(&id);
                    }
                    scope.snapshot.record_immutable(id, value);
                }
                StaticLayer::Global => scope.snapshot.record_immutable(id, value),
            }
        }
    }

    /// Apply a saved dynamic table. Values targeting immutable keys are kept
    /// in the dynamic map when they differ from the pinned value and
    /// `record` is set, but never change resolution.
    fn apply_saved(&self, scope: &mut ResolvedScope, table: &toml::Table, record: bool, cluster_target: bool) {
        for (key, raw) in table {
            let handler = match self.registry.lookup(key) {
                Ok(handler) => *handler,
                Err(e) => {
                    debug!(scope = %scope.name, error = %e, "ignoring saved key");
                    continue;
                }
            };
            if cluster_target && handler.check_scope(true).is_err() {
                continue;
            }
            let id = handler.id();
            if scope.snapshot.is_immutable(id) {
                // Secrets for immutable keys must not replace the vault value.
                let value = if handler.is_secret() {
                    let mut scratch = SecretVault::new(self.cipher.clone());
                    raw.as_str()
                        .and_then(|s| scratch.load_stored(id, s).ok())
                        .and_then(|plain| handler.validate(&plain).ok())
                } else {
                    handler.validate_toml(raw).ok()
                };
                if let Some(value) = value {
                    if record && scope.snapshot.pinned(id) != Some(&value) {
                        debug!(scope = %scope.name, key = %id, "saved value for immutable key kept for audit");
                        scope.snapshot.record_dynamic(id, value);
                    }
                }
                continue;
            }

            match scope.read(&handler, raw) {
                Ok(value) => {
                    let value = scope.apply(&handler, value);
                    if record {
                        scope.snapshot.record_dynamic(id, value);
                    }
                }
                Err(e) => warn!(scope = %scope.name, error = %e, "ignoring invalid saved setting"),
            }
        }
    }

    fn apply_cli(&self, scope: &mut ResolvedScope) {
        if self.sources.cli().is_empty() {
            return;
        }
        let table: toml::Table = self
            .sources
            .cli()
            .iter()
            .filter(|(key, _)| {
                let known = self.registry.lookup(key).is_ok();
                if !known {
                    warn!(key = %key, "ignoring unknown command line setting");
                }
                known
            })
            .map(|(k, v)| (k.clone(), toml::Value::String(v.clone())))
            .collect();
        scope.sources.push(ConfigSource::cli());
        self.apply_static(scope, &table, StaticLayer::Cli);
    }
}

/// Convert a setting value into a TOML value.
pub fn to_toml(value: &SettingValue) -> toml::Value {
    match value {
        SettingValue::Bool(b) => toml::Value::Boolean(*b),
        SettingValue::Int(i) => toml::Value::Integer(*i),
        SettingValue::Str(s) => toml::Value::String(s.clone()),
    }
}
