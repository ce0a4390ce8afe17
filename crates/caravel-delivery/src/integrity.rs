//! Post-install integrity validation.
//!
//! Re-audits installed trees: the directory must exist, be non-empty, and
//! contain no symlinks anywhere. File sizes are summed for reporting. The
//! authoritative checksum was verified over the archive bytes before
//! extraction, so tree content is not re-hashed here.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use caravel_audit::{AuditEvent, AuditSink};

use crate::error::IntegrityError;

/// What an integrity pass observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntegrityReport {
    /// Regular files found.
    pub files: usize,
    /// Total bytes across regular files.
    pub total_bytes: u64,
}

/// Validates installed module trees.
#[derive(Debug, Clone)]
pub struct IntegrityValidator {
    audit: AuditSink,
}

impl IntegrityValidator {
    /// Build a validator.
    #[must_use]
    pub fn new(audit: AuditSink) -> Self {
        Self { audit }
    }

    /// Validate one installed module tree.
    ///
    /// `module` names the tree in audit events.
    ///
    /// # Errors
    ///
    /// Returns the first [`IntegrityError`] found; an
    /// `IntegrityCheckFailed` event is emitted alongside it.
    pub fn validate(&self, module: &str, module_path: &Path) -> Result<IntegrityReport, IntegrityError> {
        match self.inspect(module_path) {
            Ok(report) => {
                debug!(module, files = report.files, bytes = report.total_bytes, "integrity check passed");
                self.audit.emit(AuditEvent::IntegrityCheckPassed {
                    module: module.to_string(),
                });
                Ok(report)
            }
            Err(error) => {
                warn!(module, %error, "integrity check failed");
                if let IntegrityError::SymlinkFound { path } = &error {
                    self.audit.emit(AuditEvent::SymlinkDetected {
                        path: path.display().to_string(),
                    });
                }
                self.audit.emit(AuditEvent::IntegrityCheckFailed {
                    module: module.to_string(),
                    reason: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Periodic sweep over `<modules>/<name>/<version>` trees.
    ///
    /// Failures are reported, not acted on — quarantine is a separate policy
    /// decision.
    pub fn sweep(&self, modules_dir: &Path) -> Vec<(String, Result<IntegrityReport, IntegrityError>)> {
        let mut results = Vec::new();
        let Ok(names) = fs::read_dir(modules_dir) else {
            return results;
        };
        for name_entry in names.flatten() {
            let name_path = name_entry.path();
            if !name_path.is_dir() {
                continue;
            }
            let module = name_entry.file_name().to_string_lossy().into_owned();
            let Ok(versions) = fs::read_dir(&name_path) else {
                continue;
            };
            for version_entry in versions.flatten() {
                let version_path = version_entry.path();
                if !version_path.is_dir() {
                    continue;
                }
                let label = format!(
                    "{module}/{}",
                    version_entry.file_name().to_string_lossy()
                );
                let result = self.validate(&label, &version_path);
                results.push((label, result));
            }
        }
        results
    }

    fn inspect(&self, module_path: &Path) -> Result<IntegrityReport, IntegrityError> {
        if !module_path.exists() {
            return Err(IntegrityError::Missing {
                path: module_path.to_path_buf(),
            });
        }
        let meta = fs::symlink_metadata(module_path)?;
        if !meta.is_dir() {
            return Err(IntegrityError::NotADirectory {
                path: module_path.to_path_buf(),
            });
        }

        let mut report = IntegrityReport::default();
        walk(module_path, &mut report)?;
        if report.files == 0 {
            return Err(IntegrityError::Empty {
                path: module_path.to_path_buf(),
            });
        }
        Ok(report)
    }
}

fn walk(dir: &Path, report: &mut IntegrityReport) -> Result<(), IntegrityError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path: PathBuf = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            return Err(IntegrityError::SymlinkFound { path });
        }
        if file_type.is_dir() {
            walk(&path, report)?;
        } else {
            report.files += 1;
            report.total_bytes = report
                .total_bytes
                .saturating_add(entry.metadata()?.len());
        }
    }
    Ok(())
}
