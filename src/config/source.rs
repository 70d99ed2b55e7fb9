//! Configuration sources with provenance.
//!
//! Every file layer is read once, parsed as TOML, and recorded with its
//! origin, path and SHA-256 digest of the raw bytes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use fleet_settings::{SettingId, SettingValue};

use super::ConfigError;

/// Section holding global settings in the main file.
pub const GLOBAL_SECTION: &str = "Default";

/// Section written to `default.toml`.
pub const SAVED_DEFAULT_SECTION: &str = "saved-default";

/// Section written to `overwrite.toml`.
pub const OVERWRITE_SECTION: &str = "overwrite-default";

/// Pseudo-cluster used when no cluster is discovered.
pub const DEFAULT_CLUSTER: &str = "Default";

pub const IMMUTABLE_FILE: &str = "immutable.toml";
pub const SAVED_DEFAULT_FILE: &str = "default.toml";
pub const OVERWRITE_FILE: &str = "overwrite.toml";

/// Working directory entries that are never clusters.
const RESERVED_DIRS: &[&str] = &[".pull", ".git", "backups", "graphite"];

/// Origin of a configuration layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SourceOrigin {
    Builtin,
    Global,
    Include,
    SharedOverride,
    Cluster,
    SavedGlobal,
    SavedCluster,
    Cli,
}

/// A contributing config source with provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigSource {
    pub origin: SourceOrigin,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 digest of raw file bytes (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ConfigSource {
    pub fn builtin() -> Self {
        Self {
            origin: SourceOrigin::Builtin,
            path: None,
            digest: None,
        }
    }

    pub fn cli() -> Self {
        Self {
            origin: SourceOrigin::Cli,
            path: None,
            digest: None,
        }
    }
}

/// A parsed TOML file.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub source: ConfigSource,
    pub table: toml::Table,
}

impl SourceFile {
    /// Read and parse `path`. `Ok(None)` when the file does not exist.
    pub fn load(path: &Path, origin: SourceOrigin) -> Result<Option<Self>, ConfigError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let digest = hex::encode(Sha256::digest(&bytes));

        let contents = String::from_utf8(bytes).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: format!("invalid UTF-8: {}", e),
        })?;
        let table: toml::Table = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(Some(Self {
            source: ConfigSource {
                origin,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
            },
            table,
        }))
    }

    /// A named `[section]` of this file.
    pub fn section(&self, name: &str) -> Option<&toml::Table> {
        self.table.get(name).and_then(toml::Value::as_table)
    }

    /// Names of every top-level table.
    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.table
            .iter()
            .filter(|(_, v)| v.is_table())
            .map(|(k, _)| k.as_str())
    }

    fn with_origin(mut self, origin: SourceOrigin) -> Self {
        self.source.origin = origin;
        self
    }
}

/// Where to find configuration on startup.
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    /// Main configuration file.
    pub config_file: Option<PathBuf>,
    /// Directory of additional `*.toml` files; defaults to `cluster.d` next
    /// to the main file.
    pub include_dir: Option<PathBuf>,
    /// Working directory; defaults to `monitoring-datadir` from the global
    /// section.
    pub datadir: Option<PathBuf>,
    /// Clusters to monitor; discovered when empty.
    pub clusters: Vec<String>,
    /// Command line `key=value` overrides.
    pub overrides: Vec<(String, String)>,
}

/// Every configuration source known at startup.
#[derive(Debug, Clone)]
pub struct ConfigSources {
    datadir: PathBuf,
    global: Vec<SourceFile>,
    overwrite: Option<SourceFile>,
    saved_default: Option<SourceFile>,
    cli: Vec<(String, String)>,
    explicit_clusters: Vec<String>,
}

impl ConfigSources {
    /// Load the main file, include directory and saved artifacts.
    ///
    /// A main or include file that exists but cannot be parsed is fatal. A
    /// saved artifact that cannot be parsed is logged and ignored.
    pub fn load(options: &SourceOptions) -> Result<Self, ConfigError> {
        let mut global = Vec::new();

        if let Some(path) = &options.config_file {
            match SourceFile::load(path, SourceOrigin::Global)? {
                Some(file) => global.push(file),
                None => warn!(path = %path.display(), "main configuration file not found, using defaults"),
            }
        }

        let include_dir = options.include_dir.clone().or_else(|| {
            options
                .config_file
                .as_deref()
                .and_then(Path::parent)
                .map(|dir| dir.join("cluster.d"))
        });
        if let Some(dir) = include_dir {
            global.extend(load_include_dir(&dir)?);
        }

        let datadir = match &options.datadir {
            Some(dir) => dir.clone(),
            None => datadir_from(&global, &options.overrides),
        };

        let overwrite = load_saved(&datadir.join(OVERWRITE_FILE), SourceOrigin::SharedOverride);
        let saved_default = load_saved(&datadir.join(SAVED_DEFAULT_FILE), SourceOrigin::SavedGlobal);

        Ok(Self {
            datadir,
            global,
            overwrite,
            saved_default,
            cli: options.overrides.clone(),
            explicit_clusters: options.clusters.clone(),
        })
    }

    /// Sources built from in-memory tables.
    pub fn from_parts(datadir: PathBuf, global: Vec<SourceFile>, cli: Vec<(String, String)>) -> Self {
        let overwrite = load_saved(&datadir.join(OVERWRITE_FILE), SourceOrigin::SharedOverride);
        let saved_default = load_saved(&datadir.join(SAVED_DEFAULT_FILE), SourceOrigin::SavedGlobal);
        Self {
            datadir,
            global,
            overwrite,
            saved_default,
            cli,
            explicit_clusters: Vec::new(),
        }
    }

    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    pub fn global_files(&self) -> &[SourceFile] {
        &self.global
    }

    pub fn overwrite(&self) -> Option<&SourceFile> {
        self.overwrite.as_ref()
    }

    pub fn saved_default(&self) -> Option<&SourceFile> {
        self.saved_default.as_ref()
    }

    pub fn cli(&self) -> &[(String, String)] {
        &self.cli
    }

    /// Saved snapshot of one cluster, `<datadir>/<cluster>/<cluster>.toml`.
    pub fn saved_cluster(&self, cluster: &str) -> Option<SourceFile> {
        load_saved(&cluster_snapshot_path(&self.datadir, cluster), SourceOrigin::SavedCluster)
    }

    /// Clusters to monitor.
    ///
    /// An explicit list wins. Otherwise every non-reserved section of the
    /// global files plus every working directory subdirectory carrying a
    /// saved snapshot. With nothing found, the single pseudo-cluster
    /// `Default`.
    pub fn cluster_names(&self) -> Vec<String> {
        if !self.explicit_clusters.is_empty() {
            return self.explicit_clusters.clone();
        }

        let mut names = BTreeSet::new();
        for file in &self.global {
            for name in file.section_names() {
                if is_cluster_section(name) {
                    names.insert(name.to_string());
                }
            }
        }

        if let Ok(entries) = fs::read_dir(&self.datadir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if RESERVED_DIRS.contains(&name.as_str()) || !entry.path().is_dir() {
                    continue;
                }
                if cluster_snapshot_path(&self.datadir, &name).is_file() {
                    debug!(cluster = %name, "discovered cluster from saved snapshot");
                    names.insert(name);
                }
            }
        }

        if names.is_empty() {
            return vec![DEFAULT_CLUSTER.to_string()];
        }
        names.into_iter().collect()
    }
}

/// Path of a cluster's saved snapshot.
pub fn cluster_snapshot_path(datadir: &Path, cluster: &str) -> PathBuf {
    datadir.join(cluster).join(format!("{}.toml", cluster))
}

/// Section name of a cluster's saved snapshot.
pub fn saved_cluster_section(cluster: &str) -> String {
    format!("saved-{}", cluster)
}

fn is_cluster_section(name: &str) -> bool {
    name != GLOBAL_SECTION && !name.starts_with("saved-") && !name.starts_with("overwrite-")
}

fn load_include_dir(dir: &Path) -> Result<Vec<SourceFile>, ConfigError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(ConfigError::Io {
                path: dir.to_path_buf(),
                source: e,
            })
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut files = Vec::new();
    for path in paths {
        if let Some(file) = SourceFile::load(&path, SourceOrigin::Include)? {
            debug!(path = %path.display(), "loaded include file");
            files.push(file);
        }
    }
    Ok(files)
}

fn load_saved(path: &Path, origin: SourceOrigin) -> Option<SourceFile> {
    match SourceFile::load(path, origin) {
        Ok(file) => file.map(|f| f.with_origin(origin)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable saved configuration");
            None
        }
    }
}

fn datadir_from(global: &[SourceFile], cli: &[(String, String)]) -> PathBuf {
    let name = SettingId::MonitoringDatadir.name();
    let from_cli = cli
        .iter()
        .rev()
        .find(|(k, _)| SettingId::from_name(k) == Some(SettingId::MonitoringDatadir))
        .map(|(_, v)| v.clone());
    let from_files = global
        .iter()
        .rev()
        .find_map(|f| f.section(GLOBAL_SECTION)?.get(name)?.as_str().map(str::to_string));
    let fallback = SettingValue::from(SettingId::MonitoringDatadir.spec().default).to_string();
    PathBuf::from(from_cli.or(from_files).unwrap_or(fallback))
}

/// Parse `key=value` command line overrides.
pub fn parse_override(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("'{}' is not key=value", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("'{}' has an empty key", raw));
    }
    Ok((key.to_string(), value.trim().to_string()))
}
