//! Setting dispatch registry.
//!
//! Maps every setting name (and alias) to a [`Handler`] bundle registered
//! once at startup. Dispatch is a single lookup; a miss is the distinct
//! [`SettingError::Unknown`] condition.

use std::collections::{HashMap, HashSet};

use crate::cron::validate_cron;
use crate::error::SettingError;
use crate::id::{SettingId, SettingKind, SettingScope, SettingSpec, SETTINGS};
use crate::settings::{split_list, Settings};
use crate::value::SettingValue;

/// Semantic validation applied after the value has the right shape.
pub type ValidateFn = fn(&SettingSpec, &SettingValue) -> Result<(), String>;

/// Stores a validated value into the aggregate.
pub type ApplyFn = fn(&mut Settings, SettingId, SettingValue);

/// Handler bundle for one setting.
#[derive(Clone, Copy)]
pub struct Handler {
    spec: &'static SettingSpec,
    validate: ValidateFn,
    apply: ApplyFn,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").field("setting", &self.spec.name).finish()
    }
}

impl Handler {
    pub fn id(&self) -> SettingId {
        self.spec.id
    }

    pub fn spec(&self) -> &'static SettingSpec {
        self.spec
    }

    pub fn is_secret(&self) -> bool {
        self.spec.id.is_secret()
    }

    /// Parse and validate a raw string value from the API or command line.
    pub fn validate(&self, raw: &str) -> Result<SettingValue, SettingError> {
        let value = SettingValue::parse(self.spec.kind, raw)
            .map_err(|reason| SettingError::bad_input(self.spec.name, reason))?;
        self.check(value)
    }

    /// Validate a value read from a config file.
    pub fn validate_toml(&self, value: &toml::Value) -> Result<SettingValue, SettingError> {
        let value = SettingValue::from_toml(self.spec.kind, value)
            .map_err(|reason| SettingError::bad_input(self.spec.name, reason))?;
        self.check(value)
    }

    fn check(&self, value: SettingValue) -> Result<SettingValue, SettingError> {
        (self.validate)(self.spec, &value)
            .map_err(|reason| SettingError::bad_input(self.spec.name, reason))?;
        Ok(value)
    }

    pub fn apply(&self, settings: &mut Settings, value: SettingValue) {
        (self.apply)(settings, self.spec.id, value)
    }

    /// Reject server-scoped settings when targeting a cluster.
    pub fn check_scope(&self, cluster_target: bool) -> Result<(), SettingError> {
        if cluster_target && self.spec.scope == SettingScope::Server {
            return Err(SettingError::WrongScope {
                key: self.spec.name.to_string(),
                scope: SettingScope::Server,
            });
        }
        Ok(())
    }
}

/// Registry of setting handlers keyed by name and alias.
#[derive(Debug, Clone)]
pub struct Registry {
    by_name: HashMap<&'static str, Handler>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Registry {
    /// Registry of every built-in setting.
    pub fn builtin() -> Self {
        let mut by_name = HashMap::new();
        for spec in SETTINGS {
            let handler = Handler {
                spec,
                validate: validator_for(spec),
                apply: apply_for(spec),
            };
            by_name.insert(spec.name, handler);
            for alias in spec.aliases {
                by_name.insert(*alias, handler);
            }
        }
        Self { by_name }
    }

    pub fn lookup(&self, name: &str) -> Result<&Handler, SettingError> {
        let key = name.trim().to_ascii_lowercase();
        self.by_name
            .get(key.as_str())
            .ok_or_else(|| SettingError::Unknown(name.to_string()))
    }

    pub fn handler(&self, id: SettingId) -> &Handler {
        // Built from SETTINGS, so every canonical name is present.
        &self.by_name[id.name()]
    }

    pub fn len(&self) -> usize {
        SETTINGS.len()
    }

    pub fn is_empty(&self) -> bool {
        SETTINGS.is_empty()
    }
}

fn validator_for(spec: &SettingSpec) -> ValidateFn {
    match spec.kind {
        SettingKind::Int => validate_range,
        SettingKind::Cron => validate_schedule,
        SettingKind::HostList => validate_host_list,
        SettingKind::Bool | SettingKind::Str => accept,
    }
}

fn apply_for(spec: &SettingSpec) -> ApplyFn {
    match spec.kind {
        SettingKind::HostList => apply_host_list,
        _ => apply_value,
    }
}

fn accept(_: &SettingSpec, _: &SettingValue) -> Result<(), String> {
    Ok(())
}

fn validate_range(spec: &SettingSpec, value: &SettingValue) -> Result<(), String> {
    let (Some(number), Some((low, high))) = (value.as_int(), spec.range) else {
        return Ok(());
    };
    if number < low || number > high {
        return Err(format!("{} outside {}..={}", number, low, high));
    }
    Ok(())
}

fn validate_schedule(_: &SettingSpec, value: &SettingValue) -> Result<(), String> {
    validate_cron(value.as_str().unwrap_or_default())
}

fn validate_host_list(_: &SettingSpec, value: &SettingValue) -> Result<(), String> {
    let mut seen = HashSet::new();
    for entry in split_list(value.as_str().unwrap_or_default()) {
        let (host, port) = entry
            .rsplit_once(':')
            .ok_or_else(|| format!("'{}' is not host:port", entry))?;
        if host.is_empty() {
            return Err(format!("'{}' has an empty host", entry));
        }
        port.parse::<u16>()
            .map_err(|_| format!("'{}' has an invalid port", entry))?;
        if !seen.insert(entry.clone()) {
            return Err(format!("duplicate entry '{}'", entry));
        }
    }
    Ok(())
}

fn apply_value(settings: &mut Settings, id: SettingId, value: SettingValue) {
    settings.set(id, value);
}

fn apply_host_list(settings: &mut Settings, id: SettingId, value: SettingValue) {
    let normalized = split_list(value.as_str().unwrap_or_default()).join(",");
    settings.set(id, SettingValue::Str(normalized));
}
