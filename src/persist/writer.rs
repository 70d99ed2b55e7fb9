//! Checksum-gated artifact writer.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

use super::checksum::{ChecksumRecord, SECRET_SUFFIX};
use super::render::Artifact;
use super::PersistError;

/// Outcome of one save pass.
#[derive(Debug, Default)]
pub struct SaveReport {
    /// Some artifact differs from its recorded checksum.
    pub changed: bool,
    pub written: Vec<String>,
    /// Artifacts skipped because the working directory is not writable.
    pub skipped: Vec<String>,
    pub errors: Vec<(String, io::Error)>,
}

impl SaveReport {
    /// Fold the report of another batch into this one.
    pub fn merge(&mut self, other: SaveReport) {
        self.changed |= other.changed;
        self.written.extend(other.written);
        self.skipped.extend(other.skipped);
        self.errors.extend(other.errors);
    }

    /// `Ok(changed)` unless some artifact failed with an error other than a
    /// permission problem.
    pub fn into_result(self) -> Result<bool, PersistError> {
        let mut errors = self.errors.into_iter();
        match errors.next() {
            None => Ok(self.changed),
            Some((artifact, source)) => Err(PersistError::Write {
                artifact,
                failed: 1 + errors.count(),
                source,
            }),
        }
    }
}

/// Writes artifacts under the working directory when their content changed.
#[derive(Debug)]
pub struct PersistenceWriter {
    datadir: PathBuf,
    record: ChecksumRecord,
}

impl PersistenceWriter {
    pub fn new(datadir: impl Into<PathBuf>) -> Self {
        Self {
            datadir: datadir.into(),
            record: ChecksumRecord::new(),
        }
    }

    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    pub fn record(&self) -> &ChecksumRecord {
        &self.record
    }

    /// Forget the records of a removed artifact.
    pub fn forget(&mut self, artifact: &str) {
        self.record.forget_artifact(artifact);
    }

    /// Write every artifact whose plaintext or secret digest differs from
    /// the record. A record advances only after its write succeeded.
    pub fn save(&mut self, artifacts: Vec<Artifact>) -> SaveReport {
        let mut report = SaveReport::default();

        // Writability may change after startup; re-check on every pass.
        if let Err(e) = fs::create_dir_all(&self.datadir) {
            for artifact in artifacts {
                report.changed |= self.is_changed(&artifact);
                self.fail(&mut report, artifact.name, e.kind(), io::Error::new(e.kind(), e.to_string()));
            }
            return report;
        }

        for artifact in artifacts {
            let changed = self.is_changed(&artifact);
            let path = self.datadir.join(&artifact.path);
            report.changed |= changed;

            if !changed && !artifact.rewrite && path.exists() {
                continue;
            }

            match write_atomic(&path, artifact.body.as_bytes()) {
                Ok(()) => {
                    debug!(artifact = %artifact.name, path = %path.display(), changed, "artifact written");
                    self.record.advance(artifact.name.clone(), artifact.plain_digest);
                    self.record
                        .advance(format!("{}{}", artifact.name, SECRET_SUFFIX), artifact.secret_digest);
                    report.written.push(artifact.name);
                }
                Err(e) => {
                    let kind = e.kind();
                    self.fail(&mut report, artifact.name, kind, e);
                }
            }
        }

        if report.changed {
            debug!(written = report.written.len(), "artifact batch saved");
        }
        report
    }

    fn is_changed(&self, artifact: &Artifact) -> bool {
        !self.record.matches(&artifact.name, &artifact.plain_digest)
            || !self.record.matches(
                &format!("{}{}", artifact.name, SECRET_SUFFIX),
                &artifact.secret_digest,
            )
    }

    fn fail(&self, report: &mut SaveReport, artifact: String, kind: io::ErrorKind, e: io::Error) {
        if kind == io::ErrorKind::PermissionDenied {
            warn!(artifact = %artifact, error = %e, "working directory not writable, skipping artifact");
            report.skipped.push(artifact);
        } else {
            error!(artifact = %artifact, error = %e, "failed to write artifact");
            report.errors.push((artifact, e));
        }
    }
}

/// Write-then-rename so readers never see a partial file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&temp_path, contents)?;
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}
