//! Export of configuration files to the backup directory.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::PersistError;

/// Files exported on shutdown.
const INCLUDE: &[&str] = &["*.toml", "**/*.toml", "**/acls.json"];

/// Never exported.
const EXCLUDE: &[&str] = &[".pull/**", ".git/**", "backups/**"];

fn glob_set(patterns: &[&str]) -> Result<GlobSet, PersistError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Copy every config file under `datadir` to `backup_dir`, keeping relative
/// paths. Returns the number of files copied.
pub fn export_to_backup(datadir: &Path, backup_dir: &Path) -> Result<usize, PersistError> {
    let include = glob_set(INCLUDE)?;
    let exclude = glob_set(EXCLUDE)?;

    let mut copied = 0;
    for entry in WalkDir::new(datadir)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel_path) = entry.path().strip_prefix(datadir) else {
            continue;
        };
        if exclude.is_match(rel_path) || !include.is_match(rel_path) {
            continue;
        }

        let target = backup_dir.join(rel_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(entry.path(), &target)?;
        debug!(file = %rel_path.display(), "exported to backup");
        copied += 1;
    }

    info!(backup_dir = %backup_dir.display(), copied, "configuration exported to backup directory");
    Ok(copied)
}
