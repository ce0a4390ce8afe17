//! Quarantine of suspect artifacts.
//!
//! Artifacts that fail a security check are moved — not copied — into
//! `<quarantine>/<module_id>/`, so the caller loses the filesystem location
//! the moment the handoff succeeds. The in-memory index is persisted as a
//! JSON file inside the quarantine root and reloaded on construction, so
//! `list` survives a restart.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use caravel_audit::{AuditEvent, AuditSink};
use caravel_core::{Clock, ModuleId};

use crate::error::QuarantineError;

const INDEX_FILE: &str = "index.json";

/// One quarantined artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    /// Module the artifact belongs to.
    pub module_id: ModuleId,
    /// Why it was quarantined.
    pub reason: String,
    /// When it was quarantined.
    pub quarantined_at: DateTime<Utc>,
    /// Where the artifact came from.
    pub original_path: PathBuf,
    /// Where it now lives inside the quarantine.
    pub quarantine_path: PathBuf,
}

/// Serialized quarantine index and directory owner.
#[derive(Debug)]
pub struct QuarantineManager {
    root: PathBuf,
    index: Mutex<HashMap<ModuleId, QuarantineEntry>>,
    clock: Arc<dyn Clock>,
    audit: AuditSink,
}

impl QuarantineManager {
    /// Open (or create) the quarantine at `root`, reloading any persisted
    /// index. A corrupt index file is discarded with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the quarantine root cannot be created.
    pub fn open(
        root: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        audit: AuditSink,
    ) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let index_path = root.join(INDEX_FILE);
        let index = match fs::read(&index_path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<QuarantineEntry>>(&bytes) {
                Ok(entries) => entries
                    .into_iter()
                    .map(|e| (e.module_id.clone(), e))
                    .collect(),
                Err(e) => {
                    warn!(error = %e, "discarding corrupt quarantine index");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            root,
            index: Mutex::new(index),
            clock,
            audit,
        })
    }

    /// Move `path` into quarantine under `module_id`.
    ///
    /// An existing entry for the module is replaced and its artifact removed.
    /// Returns the new quarantine path.
    ///
    /// # Errors
    ///
    /// Returns [`QuarantineError::Io`] if the artifact cannot be moved.
    pub async fn quarantine(
        &self,
        module_id: &ModuleId,
        path: &Path,
        reason: &str,
    ) -> Result<PathBuf, QuarantineError> {
        let mut index = self.index.lock().await;

        let module_dir = self.root.join(module_id.as_str());
        if module_dir.exists() {
            fs::remove_dir_all(&module_dir)?;
        }
        fs::create_dir_all(&module_dir)?;

        let file_name = path
            .file_name()
            .map_or_else(|| "artifact".into(), |n| n.to_os_string());
        let quarantine_path = module_dir.join(file_name);
        move_path(path, &quarantine_path)?;

        let entry = QuarantineEntry {
            module_id: module_id.clone(),
            reason: reason.to_string(),
            quarantined_at: self.clock.now(),
            original_path: path.to_path_buf(),
            quarantine_path: quarantine_path.clone(),
        };
        index.insert(module_id.clone(), entry);
        self.persist(&index);

        info!(%module_id, reason, path = %quarantine_path.display(), "artifact quarantined");
        self.audit.emit(AuditEvent::ModuleQuarantined {
            module_id: module_id.clone(),
            reason: reason.to_string(),
        });
        Ok(quarantine_path)
    }

    /// Move a quarantined artifact back to its recorded original path.
    ///
    /// # Errors
    ///
    /// Returns [`QuarantineError::NotInQuarantine`] for an unknown module and
    /// [`QuarantineError::Io`] if the artifact cannot be moved back (the
    /// entry is kept in that case).
    pub async fn release(&self, module_id: &ModuleId) -> Result<PathBuf, QuarantineError> {
        let mut index = self.index.lock().await;
        let entry = index
            .remove(module_id)
            .ok_or_else(|| QuarantineError::NotInQuarantine(module_id.clone()))?;

        if let Some(parent) = entry.original_path.parent().map(Path::to_path_buf) {
            if let Err(e) = fs::create_dir_all(&parent) {
                index.insert(module_id.clone(), entry);
                return Err(e.into());
            }
        }
        if let Err(e) = move_path(&entry.quarantine_path, &entry.original_path) {
            index.insert(module_id.clone(), entry);
            return Err(e.into());
        }
        let _ = fs::remove_dir_all(self.root.join(module_id.as_str()));
        self.persist(&index);

        debug!(%module_id, path = %entry.original_path.display(), "quarantined artifact released");
        self.audit.emit(AuditEvent::QuarantineReleased {
            module_id: module_id.clone(),
        });
        Ok(entry.original_path)
    }

    /// Permanently delete a quarantined artifact.
    ///
    /// # Errors
    ///
    /// Returns [`QuarantineError::NotInQuarantine`] for an unknown module.
    pub async fn delete(&self, module_id: &ModuleId) -> Result<(), QuarantineError> {
        let mut index = self.index.lock().await;
        if index.remove(module_id).is_none() {
            return Err(QuarantineError::NotInQuarantine(module_id.clone()));
        }
        fs::remove_dir_all(self.root.join(module_id.as_str()))?;
        self.persist(&index);
        debug!(%module_id, "quarantined artifact deleted");
        Ok(())
    }

    /// Snapshot of all entries, sorted by module id.
    pub async fn list(&self) -> Vec<QuarantineEntry> {
        let index = self.index.lock().await;
        let mut entries: Vec<_> = index.values().cloned().collect();
        entries.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        entries
    }

    fn persist(&self, index: &HashMap<ModuleId, QuarantineEntry>) {
        let mut entries: Vec<_> = index.values().collect();
        entries.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        match serde_json::to_vec_pretty(&entries) {
            Ok(bytes) => {
                if let Err(e) = fs::write(self.root.join(INDEX_FILE), bytes) {
                    warn!(error = %e, "failed to persist quarantine index");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize quarantine index"),
        }
    }
}

/// Move a file or directory, falling back to copy+delete across filesystems.
fn move_path(src: &Path, dst: &Path) -> std::io::Result<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    let meta = fs::symlink_metadata(src)?;
    if meta.is_dir() {
        copy_dir(src, dst)?;
        fs::remove_dir_all(src)
    } else {
        fs::copy(src, dst)?;
        fs::remove_file(src)
    }
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}
