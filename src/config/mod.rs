//! Configuration resolution
//!
//! Loads the configuration sources, resolves the global scope and every
//! cluster through the layered precedence rules, and keeps a per-scope
//! snapshot of the Immutable/Dynamic classification.

mod resolve;
mod snapshot;
mod source;

use std::path::PathBuf;

pub use resolve::{to_toml, LayeredResolver, ResolvedScope, GLOBAL_SCOPE, REDACTED};
pub use snapshot::{ConfigSnapshot, SettingDiff};
pub use source::{
    cluster_snapshot_path, parse_override, saved_cluster_section, ConfigSource, ConfigSources,
    SourceFile, SourceOptions, SourceOrigin, DEFAULT_CLUSTER, GLOBAL_SECTION, IMMUTABLE_FILE,
    OVERWRITE_FILE, OVERWRITE_SECTION, SAVED_DEFAULT_FILE, SAVED_DEFAULT_SECTION,
};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),
}
