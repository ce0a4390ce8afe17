//! Atomic module installation with backup and rollback.
//!
//! The final directory only ever changes through single renames: an existing
//! install is renamed aside as a backup, the incoming tree is copied into a
//! transient staging directory on the same filesystem, then renamed onto the
//! final path. Any failure restores the backup and removes every transient,
//! so a reader never observes a partially populated install.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use caravel_audit::{AuditEvent, AuditSink};
use caravel_core::InstallLayout;

use crate::error::InstallError;

/// Installs validated staging trees under the modules root.
#[derive(Debug, Clone)]
pub struct AtomicInstaller {
    layout: InstallLayout,
    audit: AuditSink,
}

impl AtomicInstaller {
    /// Build an installer over the given layout.
    #[must_use]
    pub fn new(layout: InstallLayout, audit: AuditSink) -> Self {
        Self { layout, audit }
    }

    /// Install `source_staging` as `<modules>/<name>/<version>`.
    ///
    /// On success the final directory holds the complete tree and no backup
    /// remains. On failure the previous install (if any) is restored and the
    /// error carries the detail.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::InstallationFailed`] after rolling back.
    pub fn install(
        &self,
        source_staging: &Path,
        name: &str,
        version: &str,
    ) -> Result<PathBuf, InstallError> {
        let final_dir = self.layout.module_dir(name, version);

        match self.install_inner(source_staging, name, version, &final_dir) {
            Ok(()) => {
                info!(module = name, version, path = %final_dir.display(), "module installed");
                self.audit.emit(AuditEvent::InstallationSuccess {
                    module: name.to_string(),
                    version: version.to_string(),
                });
                Ok(final_dir)
            }
            Err(detail) => {
                self.audit.emit(AuditEvent::InstallationFailed {
                    module: name.to_string(),
                    detail: detail.clone(),
                });
                Err(InstallError::InstallationFailed {
                    module: name.to_string(),
                    version: version.to_string(),
                    detail,
                })
            }
        }
    }

    fn install_inner(
        &self,
        source_staging: &Path,
        name: &str,
        version: &str,
        final_dir: &Path,
    ) -> Result<(), String> {
        let parent = final_dir
            .parent()
            .ok_or_else(|| "final directory has no parent".to_string())?;
        fs::create_dir_all(parent).map_err(|e| format!("failed to create {}: {e}", parent.display()))?;

        // Move any existing install aside before touching it.
        let backup = if final_dir.exists() {
            let epoch = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            let backup_path = self.layout.backup_dir(name, version, epoch);
            if let Some(backup_parent) = backup_path.parent() {
                fs::create_dir_all(backup_parent)
                    .map_err(|e| format!("failed to create backup root: {e}"))?;
            }
            fs::rename(final_dir, &backup_path)
                .map_err(|e| format!("failed to back up existing install: {e}"))?;
            debug!(backup = %backup_path.display(), "existing install backed up");
            Some(backup_path)
        } else {
            None
        };

        // Copy into a transient sibling of the final directory so the
        // promotion below is a same-filesystem rename.
        let transient = match tempfile::tempdir_in(parent) {
            Ok(dir) => dir,
            Err(e) => {
                self.restore(&backup, final_dir, name);
                return Err(format!("failed to create transient staging: {e}"));
            }
        };

        if let Err(e) = copy_tree(source_staging, transient.path()) {
            self.restore(&backup, final_dir, name);
            return Err(format!("failed to copy staging tree: {e}"));
        }
        if let Err(e) = validate_installed(transient.path()) {
            self.restore(&backup, final_dir, name);
            return Err(format!("staging tree failed validation: {e}"));
        }

        let transient_path = transient.keep();
        if let Err(e) = fs::rename(&transient_path, final_dir) {
            let _ = fs::remove_dir_all(&transient_path);
            self.restore(&backup, final_dir, name);
            return Err(format!("failed to promote staging to final: {e}"));
        }

        if let Err(e) = validate_installed(final_dir) {
            let _ = fs::remove_dir_all(final_dir);
            self.restore(&backup, final_dir, name);
            return Err(format!("installed tree failed validation: {e}"));
        }

        // Success: the backup is no longer needed.
        if let Some(backup_path) = backup {
            let _ = fs::remove_dir_all(backup_path);
        }
        Ok(())
    }

    /// Restore a backup over a failed install, removing any partial final.
    fn restore(&self, backup: &Option<PathBuf>, final_dir: &Path, name: &str) {
        if final_dir.exists() {
            let _ = fs::remove_dir_all(final_dir);
        }
        if let Some(backup_path) = backup
            && backup_path.exists()
        {
            if let Err(e) = fs::rename(backup_path, final_dir) {
                warn!(module = name, error = %e, "failed to restore backup");
            } else {
                info!(module = name, "previous install restored from backup");
                self.audit.emit(AuditEvent::RollbackPerformed {
                    module: name.to_string(),
                });
            }
        }
    }
}

/// Recursively copy a directory tree, rejecting symlinks.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if file_type.is_symlink() {
            return Err(std::io::Error::other(format!(
                "staging tree contains a symlink at {}",
                src_path.display()
            )));
        }
        if file_type.is_dir() {
            copy_tree(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Check an installed (or about-to-be-installed) tree: non-empty, no
/// top-level symlinks. A missing `index.html` is only worth a warning — the
/// installer is content-agnostic.
fn validate_installed(dir: &Path) -> Result<(), String> {
    let mut entries = 0usize;
    let mut has_index = false;
    for entry in fs::read_dir(dir).map_err(|e| e.to_string())? {
        let entry = entry.map_err(|e| e.to_string())?;
        if entry.file_type().map_err(|e| e.to_string())?.is_symlink() {
            return Err(format!(
                "symlink at top level: {}",
                entry.path().display()
            ));
        }
        if entry.file_name() == "index.html" {
            has_index = true;
        }
        entries += 1;
    }
    if entries == 0 {
        return Err("directory is empty".into());
    }
    if !has_index {
        warn!(dir = %dir.display(), "installed tree has no index.html");
    }
    Ok(())
}
