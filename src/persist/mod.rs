//! PersistenceWriter: checksum-gated, atomic persistence of configuration
//! artifacts.
//!
//! Artifacts are rendered from resolved scopes, compared against the last
//! written checksum, and only rewritten when their content changed. The
//! outcome decides whether git distribution must push.

mod backup;
mod checksum;
mod render;
mod writer;

pub use backup::export_to_backup;
pub use checksum::{sha256_hex, ChecksumRecord, SECRET_SUFFIX};
pub use render::{
    cluster_artifact, Artifact, LiveCredentials, Renderer, IMMUTABLE_ARTIFACT, OVERWRITE_ARTIFACT, SAVED_ARTIFACT,
};
pub use writer::{write_atomic, PersistenceWriter, SaveReport};

use crate::vault::VaultError;

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to write {artifact} ({failed} artifact(s) failed): {source}")]
    Write {
        artifact: String,
        failed: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to seal secret: {0}")]
    Vault(#[from] VaultError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("glob pattern error: {0}")]
    Glob(#[from] globset::Error),
}
