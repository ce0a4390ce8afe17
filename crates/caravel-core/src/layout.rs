//! On-disk layout of the install root.
//!
//! All pipeline paths derive from two roots: the documents directory (durable
//! state) and the system temp directory (per-attempt scratch). Per-attempt
//! paths embed a fresh UUID so concurrent attempts can never collide.
//!
//! ```text
//! <documents>/Modules/<module_name>/<version>/   installed module content
//! <documents>/ModuleBackups/                     transient upgrade backups
//! <documents>/Quarantine/<module_id>/            isolated suspect artifacts
//! <documents>/SecurityLogs/                      append-only audit log files
//! <tmp>/UnzipStaging/<uuid>/                     per-attempt extraction staging
//! <tmp>/<uuid>.zip                               per-attempt downloaded archive
//! ```

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Derives every pipeline path from the documents and temp roots.
#[derive(Debug, Clone)]
pub struct InstallLayout {
    documents: PathBuf,
    tmp: PathBuf,
}

impl InstallLayout {
    /// Create a layout rooted at the given documents and temp directories.
    #[must_use]
    pub fn new(documents: impl Into<PathBuf>, tmp: impl Into<PathBuf>) -> Self {
        Self {
            documents: documents.into(),
            tmp: tmp.into(),
        }
    }

    /// The documents root itself (used for disk-space preflight).
    #[must_use]
    pub fn documents_root(&self) -> &Path {
        &self.documents
    }

    /// Root directory of all installed modules.
    #[must_use]
    pub fn modules_dir(&self) -> PathBuf {
        self.documents.join("Modules")
    }

    /// Final install directory for one `(name, version)` pair.
    #[must_use]
    pub fn module_dir(&self, name: &str, version: &str) -> PathBuf {
        self.modules_dir().join(name).join(version)
    }

    /// Root directory of transient upgrade backups.
    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.documents.join("ModuleBackups")
    }

    /// Backup directory for one upgrade, stamped with an epoch so repeated
    /// upgrades of the same version cannot collide.
    #[must_use]
    pub fn backup_dir(&self, name: &str, version: &str, epoch_secs: u64) -> PathBuf {
        self.backups_dir()
            .join(format!("{name}_{version}_{epoch_secs}"))
    }

    /// Root directory of the quarantine.
    #[must_use]
    pub fn quarantine_dir(&self) -> PathBuf {
        self.documents.join("Quarantine")
    }

    /// Root directory of audit log files.
    #[must_use]
    pub fn security_logs_dir(&self) -> PathBuf {
        self.documents.join("SecurityLogs")
    }

    /// Per-attempt extraction staging directory.
    #[must_use]
    pub fn staging_dir(&self, attempt: Uuid) -> PathBuf {
        self.tmp.join("UnzipStaging").join(attempt.to_string())
    }

    /// Per-attempt downloaded archive path.
    #[must_use]
    pub fn archive_path(&self, attempt: Uuid) -> PathBuf {
        self.tmp.join(format!("{attempt}.zip"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_derive_from_roots() {
        let layout = InstallLayout::new("/docs", "/tmpdir");
        assert_eq!(
            layout.module_dir("Dashboard Module", "1.0.0"),
            PathBuf::from("/docs/Modules/Dashboard Module/1.0.0")
        );
        assert_eq!(
            layout.backup_dir("M", "1.2.3", 42),
            PathBuf::from("/docs/ModuleBackups/M_1.2.3_42")
        );
        assert_eq!(
            layout.quarantine_dir(),
            PathBuf::from("/docs/Quarantine")
        );
    }

    #[test]
    fn attempt_paths_are_unique() {
        let layout = InstallLayout::new("/docs", "/tmpdir");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(layout.staging_dir(a), layout.staging_dir(b));
        assert_ne!(layout.archive_path(a), layout.archive_path(b));
        assert!(layout.staging_dir(a).starts_with("/tmpdir/UnzipStaging"));
        assert!(
            layout
                .archive_path(a)
                .to_string_lossy()
                .ends_with(".zip")
        );
    }
}
