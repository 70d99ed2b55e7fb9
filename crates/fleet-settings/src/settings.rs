//! Typed configuration aggregate.
//!
//! [`Settings`] holds one value for every registered [`SettingId`] plus a
//! side table for extension keys that appear in config files but are not
//! registered. It is what the rest of the system reads as the effective
//! configuration of one scope.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::id::SettingId;
use crate::value::SettingValue;

/// Resolved configuration for one scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    values: BTreeMap<SettingId, SettingValue>,
    extensions: BTreeMap<String, toml::Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::defaults()
    }
}

impl Settings {
    /// Compiled-in defaults for every registered setting.
    pub fn defaults() -> Self {
        let values = SettingId::all()
            .map(|id| (id, SettingValue::from(id.spec().default)))
            .collect();
        Self {
            values,
            extensions: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: SettingId) -> &SettingValue {
        // Every id is populated at construction and never removed.
        &self.values[&id]
    }

    pub fn set(&mut self, id: SettingId, value: SettingValue) {
        self.values.insert(id, value);
    }

    /// True when the current value differs from the compiled-in default.
    pub fn differs_from_default(&self, id: SettingId) -> bool {
        *self.get(id) != SettingValue::from(id.spec().default)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SettingId, &SettingValue)> {
        self.values.iter().map(|(id, value)| (*id, value))
    }

    pub fn extensions(&self) -> &BTreeMap<String, toml::Value> {
        &self.extensions
    }

    pub fn set_extension(&mut self, key: impl Into<String>, value: toml::Value) {
        self.extensions.insert(key.into(), value);
    }

    pub fn bool(&self, id: SettingId) -> bool {
        self.get(id).as_bool().unwrap_or(false)
    }

    pub fn int(&self, id: SettingId) -> i64 {
        self.get(id).as_int().unwrap_or_default()
    }

    pub fn str(&self, id: SettingId) -> &str {
        self.get(id).as_str().unwrap_or_default()
    }

    /// Non-empty string value, `None` when unset.
    pub fn non_empty(&self, id: SettingId) -> Option<&str> {
        let value = self.str(id).trim();
        (!value.is_empty()).then_some(value)
    }

    /// Monitoring tick interval in seconds.
    pub fn monitoring_ticker(&self) -> u64 {
        self.int(SettingId::MonitoringTicker).max(1) as u64
    }

    /// Whether runtime changes are persisted and reloaded.
    pub fn save_config(&self) -> bool {
        self.bool(SettingId::MonitoringSaveConfig)
    }

    pub fn arbitration_enabled(&self) -> bool {
        self.bool(SettingId::ArbitrationExternal)
    }

    pub fn log_heartbeat(&self) -> bool {
        self.bool(SettingId::LogHeartbeat)
    }

    pub fn git_url(&self) -> Option<&str> {
        self.non_empty(SettingId::GitUrl)
    }

    pub fn git_url_pull(&self) -> Option<&str> {
        self.non_empty(SettingId::GitUrlPull)
    }

    pub fn git_monitoring_ticker(&self) -> u64 {
        self.int(SettingId::GitMonitoringTicker).max(1) as u64
    }

    pub fn token_refresh_seconds(&self) -> u64 {
        self.int(SettingId::GitTokenRefreshSeconds).max(60) as u64
    }

    /// Peer monitor addresses from `arbitration-peer-hosts`.
    pub fn peer_hosts(&self) -> Vec<String> {
        split_list(self.str(SettingId::ArbitrationPeerHosts))
    }

    pub fn db_hosts(&self) -> Vec<String> {
        split_list(self.str(SettingId::DbServersHosts))
    }
}

/// Split a comma separated list, dropping empty entries.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
