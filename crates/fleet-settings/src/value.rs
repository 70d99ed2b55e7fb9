//! Setting values and their conversions.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::id::{DefaultValue, SettingKind};

/// A typed setting value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl SettingValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Render as a TOML literal: strings quoted and escaped, the rest bare.
    pub fn to_toml_literal(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Str(s) => toml::Value::String(s.clone()).to_string(),
        }
    }

    /// Parse a raw string (API, command line) according to `kind`.
    ///
    /// Only the shape is checked here; semantic validation lives in the
    /// registry handlers.
    pub fn parse(kind: SettingKind, raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        match kind {
            SettingKind::Bool => parse_bool(raw)
                .map(Self::Bool)
                .ok_or_else(|| format!("'{}' is not a boolean", raw)),
            SettingKind::Int => raw
                .parse::<i64>()
                .map(Self::Int)
                .map_err(|_| format!("'{}' is not an integer", raw)),
            SettingKind::Str | SettingKind::Cron | SettingKind::HostList => {
                Ok(Self::Str(raw.to_string()))
            }
        }
    }

    /// Convert a TOML value read from a config file.
    ///
    /// Scalars are coerced leniently the way operators write them
    /// (`failover-limit = "3"` is accepted as an integer).
    pub fn from_toml(kind: SettingKind, value: &toml::Value) -> Result<Self, String> {
        match (kind, value) {
            (SettingKind::Bool, toml::Value::Boolean(b)) => Ok(Self::Bool(*b)),
            (SettingKind::Int, toml::Value::Integer(i)) => Ok(Self::Int(*i)),
            (_, toml::Value::String(s)) => Self::parse(kind, s),
            (SettingKind::Str, toml::Value::Integer(i)) => Ok(Self::Str(i.to_string())),
            (SettingKind::Str, toml::Value::Boolean(b)) => Ok(Self::Str(b.to_string())),
            (SettingKind::Str | SettingKind::HostList, toml::Value::Array(items)) => {
                let parts: Result<Vec<String>, String> = items
                    .iter()
                    .map(|item| match item {
                        toml::Value::String(s) => Ok(s.clone()),
                        other => Err(format!("unsupported list element {}", other)),
                    })
                    .collect();
                Ok(Self::Str(parts?.join(",")))
            }
            (_, other) => Err(format!("unsupported value {}", other)),
        }
    }
}

impl From<DefaultValue> for SettingValue {
    fn from(value: DefaultValue) -> Self {
        match value {
            DefaultValue::Bool(b) => Self::Bool(b),
            DefaultValue::Int(i) => Self::Int(i),
            DefaultValue::Str(s) => Self::Str(s.to_string()),
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Str(s) => f.write_str(s),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_variants() {
        assert_eq!(SettingValue::parse(SettingKind::Bool, "ON"), Ok(SettingValue::Bool(true)));
        assert_eq!(SettingValue::parse(SettingKind::Bool, "0"), Ok(SettingValue::Bool(false)));
        assert!(SettingValue::parse(SettingKind::Bool, "maybe").is_err());
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(SettingValue::parse(SettingKind::Int, " 10 "), Ok(SettingValue::Int(10)));
        assert!(SettingValue::parse(SettingKind::Int, "ten").is_err());
    }

    #[test]
    fn test_toml_literal_rendering() {
        assert_eq!(SettingValue::Int(3).to_toml_literal(), "3");
        assert_eq!(SettingValue::Bool(true).to_toml_literal(), "true");
        assert_eq!(SettingValue::Str("manual".into()).to_toml_literal(), "\"manual\"");
    }

    #[test]
    fn test_literal_reparses() {
        let value = SettingValue::Str("a \"quoted\" value".into());
        let doc = format!("k = {}", value.to_toml_literal());
        let table: toml::Table = toml::from_str(&doc).unwrap();
        assert_eq!(table["k"].as_str(), Some("a \"quoted\" value"));
    }

    #[test]
    fn test_from_toml_coercions() {
        let v = toml::Value::String("3".into());
        assert_eq!(SettingValue::from_toml(SettingKind::Int, &v), Ok(SettingValue::Int(3)));

        let v = toml::Value::Integer(42);
        assert_eq!(
            SettingValue::from_toml(SettingKind::Str, &v),
            Ok(SettingValue::Str("42".into()))
        );

        let v = toml::Value::Array(vec![
            toml::Value::String("db1:3306".into()),
            toml::Value::String("db2:3306".into()),
        ]);
        assert_eq!(
            SettingValue::from_toml(SettingKind::HostList, &v),
            Ok(SettingValue::Str("db1:3306,db2:3306".into()))
        );

        let v = toml::Value::Float(1.5);
        assert!(SettingValue::from_toml(SettingKind::Int, &v).is_err());
    }

    #[test]
    fn test_untagged_json() {
        let json = serde_json::to_string(&SettingValue::Int(5)).unwrap();
        assert_eq!(json, "5");
    }
}
