//! Per-scope configuration snapshot.
//!
//! `init` is the configuration as resolved when monitoring started.
//! `immutable` holds values that came from static sources (files and the
//! command line) and `dynamic` holds runtime writes, including writes to
//! immutable keys that were kept for audit only.

use serde::Serialize;
use std::collections::BTreeMap;

use fleet_settings::{SettingId, SettingValue, Settings};

/// One key whose current value differs from the initial one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingDiff {
    pub key: SettingId,
    pub init: SettingValue,
    pub current: SettingValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSnapshot {
    pub init: Settings,
    pub immutable: BTreeMap<SettingId, SettingValue>,
    /// Promoted global values applied to this scope. Each is also pinned in
    /// `immutable`.
    pub overrides: BTreeMap<SettingId, SettingValue>,
    pub dynamic: BTreeMap<SettingId, SettingValue>,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            init: Settings::defaults(),
            immutable: BTreeMap::new(),
            overrides: BTreeMap::new(),
            dynamic: BTreeMap::new(),
        }
    }
}

impl ConfigSnapshot {
    /// True when runtime writes to `id` must not change resolution.
    pub fn is_immutable(&self, id: SettingId) -> bool {
        self.immutable.contains_key(&id)
    }

    pub fn record_immutable(&mut self, id: SettingId, value: SettingValue) {
        self.immutable.insert(id, value);
    }

    pub fn record_override(&mut self, id: SettingId, value: SettingValue) {
        self.overrides.insert(id, value.clone());
        self.immutable.insert(id, value);
    }

    pub fn record_dynamic(&mut self, id: SettingId, value: SettingValue) {
        self.dynamic.insert(id, value);
    }

    /// Value the last static layer pinned for `id`.
    pub fn pinned(&self, id: SettingId) -> Option<&SettingValue> {
        self.immutable.get(&id)
    }

    /// Dynamic writes to immutable keys, kept for audit.
    pub fn audit_entries(&self) -> impl Iterator<Item = (SettingId, &SettingValue)> {
        self.dynamic
            .iter()
            .filter(|(id, _)| self.is_immutable(**id))
            .map(|(id, v)| (*id, v))
    }

    /// Keys whose current value differs from `init`.
    pub fn diff(&self, current: &Settings) -> Vec<SettingDiff> {
        current
            .iter()
            .filter(|(id, value)| self.init.get(*id) != *value)
            .map(|(id, value)| SettingDiff {
                key: id,
                init: self.init.get(id).clone(),
                current: value.clone(),
            })
            .collect()
    }
}
