//! Error types for setting lookup and validation.

use thiserror::Error;

use crate::id::SettingScope;

/// Errors raised while resolving or validating a setting.
///
/// `Unknown` is kept apart from every other failure so callers can map it to
/// a "not found" response class.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingError {
    /// No setting is registered under this name.
    #[error("unknown setting '{0}'")]
    Unknown(String),

    /// The value was rejected before any mutation.
    #[error("bad input for '{key}': {reason}")]
    BadInput { key: String, reason: String },

    /// The setting exists but cannot be set in the requested scope.
    #[error("setting '{key}' is {scope} scoped")]
    WrongScope { key: String, scope: SettingScope },
}

impl SettingError {
    /// Shorthand for a `BadInput` error.
    pub fn bad_input(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadInput {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for errors the caller should report as client errors.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::BadInput { .. } | Self::WrongScope { .. })
    }
}
