//! Backup verification.
//!
//! Walks the video files under a source folder and checks each one's
//! counterpart at the same relative path under the backup folder:
//! missing file, size mismatch (short-circuits before any hashing), then
//! checksum comparison. The result is a report; deciding what to do about
//! a bad backup is the backend's business, not this component's.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;
use walkdir::WalkDir;

use crate::checksum::ChecksumEngine;
use crate::error::AgentError;
use crate::events::VerifyProgress;
use crate::model::{IssueKind, VerificationReport};
use crate::volume::has_allowed_extension;

/// Verifies a source/backup folder pair file by file.
pub struct BackupVerifier {
    engine: ChecksumEngine,
    extensions: Vec<String>,
    running: AtomicBool,
}

impl BackupVerifier {
    pub fn new(engine: ChecksumEngine, extensions: Vec<String>) -> Self {
        BackupVerifier {
            engine,
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
            running: AtomicBool::new(false),
        }
    }

    /// Run one verification pass. `progress` is invoked once per file.
    ///
    /// Only one pass runs at a time; a second call while one is in flight
    /// gets `AgentError::Busy` rather than being queued behind it.
    ///
    /// Per-file rules: a missing or unreadable backup counterpart is
    /// `Missing` (the verifier cannot attest to bytes it cannot read); an
    /// unreadable source file is logged and skipped without stopping the
    /// pass or counting toward the total.
    ///
    /// # Errors
    /// Returns `AgentError::Busy` when a pass is already running, or
    /// `AgentError::Enumeration` if the source folder itself cannot be read.
    pub fn verify(
        &self,
        source: &Path,
        backup: &Path,
        progress: impl FnMut(&VerifyProgress),
    ) -> Result<VerificationReport, AgentError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AgentError::Busy {
                operation: "verification",
            });
        }

        let result = self.verify_inner(source, backup, progress);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn verify_inner(
        &self,
        source: &Path,
        backup: &Path,
        mut progress: impl FnMut(&VerifyProgress),
    ) -> Result<VerificationReport, AgentError> {
        if !source.is_dir() {
            return Err(AgentError::Enumeration {
                path: source.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "source folder does not exist",
                ),
            });
        }

        // Enumerate first so progress can report a total.
        let mut files: Vec<(PathBuf, u64)> = Vec::new();
        for entry in WalkDir::new(source).into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "walk error under source, skipping entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if !has_allowed_extension(entry.path(), &self.extensions) {
                continue;
            }
            match entry.metadata() {
                Ok(metadata) => files.push((entry.path().to_path_buf(), metadata.len())),
                Err(e) => warn!(path = %entry.path().display(), error = %e, "unreadable source file, skipping"),
            }
        }

        let enumerated = files.len() as u64;
        let mut report = VerificationReport {
            total: enumerated,
            ..VerificationReport::default()
        };
        let mut skipped = 0u64;

        for (index, (path, source_size)) in files.iter().enumerate() {
            let relative = path.strip_prefix(source).unwrap_or(path).to_path_buf();
            progress(&VerifyProgress {
                processed: index as u64 + 1,
                total: enumerated,
                current: relative.clone(),
            });

            let backup_path = backup.join(&relative);
            let backup_size = match std::fs::metadata(&backup_path) {
                Ok(metadata) => metadata.len(),
                Err(_) => {
                    report.record_issue(relative, IssueKind::Missing);
                    continue;
                }
            };

            // Size first; no point hashing a file of the wrong length.
            if backup_size != *source_size {
                report.record_issue(relative, IssueKind::SizeMismatch);
                continue;
            }

            let source_checksum = match self.engine.checksum_file(path) {
                Ok(checksum) => checksum,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable source file, skipping");
                    skipped += 1;
                    continue;
                }
            };
            let backup_checksum = match self.engine.checksum_file(&backup_path) {
                Ok(checksum) => checksum,
                Err(e) => {
                    warn!(path = %backup_path.display(), error = %e, "unreadable backup file");
                    report.record_issue(relative, IssueKind::Missing);
                    continue;
                }
            };

            if source_checksum == backup_checksum {
                report.record_match();
            } else {
                report.record_issue(relative, IssueKind::ChecksumMismatch);
            }
        }

        report.total = enumerated - skipped;
        Ok(report)
    }
}
