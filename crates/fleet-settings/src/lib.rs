//! Setting registry for fleet-control.
//!
//! Enumerated setting identifiers, the typed configuration aggregate, and the
//! dispatch registry mapping each setting name to its validate/apply handlers.

pub mod cron;
pub mod error;
pub mod id;
pub mod registry;
pub mod settings;
pub mod value;

pub use error::SettingError;
pub use id::{DefaultValue, SecretKind, SettingId, SettingKind, SettingScope, SettingSpec};
pub use registry::{Handler, Registry};
pub use settings::{split_list, Settings};
pub use value::SettingValue;
