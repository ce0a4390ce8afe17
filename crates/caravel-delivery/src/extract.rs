//! Two-pass ZIP validation and extraction.
//!
//! Pass 1 validates every entry against the containment and sizing rules
//! without writing a single byte; Pass 2 extracts only after the whole
//! archive passed. A hostile archive therefore either installs completely or
//! touches nothing.
//!
//! Containment is enforced twice: entry names are screened for traversal
//! components in Pass 1, and the joined path is re-checked against the
//! canonicalized destination before each write in Pass 2. Symlinks are
//! rejected from entry metadata and again by stat-ing every written file.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use zip::ZipArchive;

use caravel_audit::{AuditEvent, AuditSink};
use caravel_core::SecurityConfig;

use crate::error::ExtractError;

/// Unix file-type mask and symlink bits in ZIP external attributes.
const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// What an extraction wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionSummary {
    /// Regular files written.
    pub files_written: usize,
    /// Declared uncompressed total across all entries.
    pub declared_total: u64,
}

/// Validates and extracts module archives into a staging directory.
#[derive(Debug, Clone)]
pub struct SafeExtractor {
    max_archive_bytes: u64,
    max_total_uncompressed: u64,
    max_entry_bytes: u64,
    max_entries: usize,
    allowed_extensions: HashSet<String>,
    forbidden_patterns: Vec<String>,
    audit: AuditSink,
}

impl SafeExtractor {
    /// Build an extractor from configuration.
    #[must_use]
    pub fn new(config: &SecurityConfig, audit: AuditSink) -> Self {
        Self {
            max_archive_bytes: config.limits.max_download_size,
            max_total_uncompressed: config.limits.max_uncompressed_size,
            max_entry_bytes: config.limits.max_individual_file_size,
            max_entries: config.limits.max_file_count,
            allowed_extensions: config
                .extraction
                .allowed_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            forbidden_patterns: config.extraction.forbidden_patterns.clone(),
            audit,
        }
    }

    /// Validate `archive` and extract it into `dest`.
    ///
    /// Nothing is written unless the whole archive passes validation.
    ///
    /// # Errors
    ///
    /// Returns the [`ExtractError`] for the first rule the archive violated.
    pub fn extract(&self, archive: &Path, dest: &Path) -> Result<ExtractionSummary, ExtractError> {
        let archive_bytes = fs::metadata(archive)?.len();
        if archive_bytes > self.max_archive_bytes {
            return Err(ExtractError::ArchiveTooLarge {
                size: archive_bytes,
                limit: self.max_archive_bytes,
            });
        }

        let file = File::open(archive)?;
        let mut zip =
            ZipArchive::new(file).map_err(|e| ExtractError::Malformed(e.to_string()))?;

        let declared_total = self.validate_entries(&mut zip)?;
        let files_written = self.write_entries(&mut zip, dest)?;

        debug!(
            files_written,
            declared_total,
            dest = %dest.display(),
            "archive extracted"
        );
        Ok(ExtractionSummary {
            files_written,
            declared_total,
        })
    }

    /// Pass 1: validate every entry without writing.
    fn validate_entries(&self, zip: &mut ZipArchive<File>) -> Result<u64, ExtractError> {
        if zip.len() > self.max_entries {
            return Err(ExtractError::TooManyEntries {
                count: zip.len(),
                limit: self.max_entries,
            });
        }

        let mut declared_total: u64 = 0;
        for index in 0..zip.len() {
            let entry = zip
                .by_index(index)
                .map_err(|e| ExtractError::Malformed(e.to_string()))?;
            let name = entry.name().to_string();

            self.screen_name(&name)?;

            if let Some(mode) = entry.unix_mode()
                && mode & S_IFMT == S_IFLNK
            {
                warn!(entry = %name, "symlink entry in archive");
                self.audit
                    .emit(AuditEvent::SymlinkDetected { path: name.clone() });
                return Err(ExtractError::SymlinkDetected { entry: name });
            }

            if !entry.is_dir() {
                if let Some(extension) = Path::new(&name)
                    .extension()
                    .and_then(|e| e.to_str())
                {
                    let extension = extension.to_ascii_lowercase();
                    if !self.allowed_extensions.contains(&extension) {
                        self.audit
                            .emit(AuditEvent::ForbiddenFileDetected { entry: name.clone() });
                        return Err(ExtractError::UnsupportedFileType {
                            entry: name,
                            extension,
                        });
                    }
                }

                let size = entry.size();
                if size > self.max_entry_bytes {
                    return Err(ExtractError::EntryTooLarge {
                        entry: name,
                        size,
                        limit: self.max_entry_bytes,
                    });
                }
                declared_total = declared_total.saturating_add(size);
            }
        }

        if declared_total > self.max_total_uncompressed {
            warn!(declared_total, "declared uncompressed total exceeds cap");
            self.audit
                .emit(AuditEvent::ZipBombDetected { declared_total });
            return Err(ExtractError::TotalSizeExceeded {
                declared: declared_total,
                limit: self.max_total_uncompressed,
            });
        }

        Ok(declared_total)
    }

    /// Pass 2: extract, re-checking containment before each write.
    fn write_entries(
        &self,
        zip: &mut ZipArchive<File>,
        dest: &Path,
    ) -> Result<usize, ExtractError> {
        fs::create_dir_all(dest)?;
        let canonical_dest = dest.canonicalize()?;

        let mut files_written = 0usize;
        for index in 0..zip.len() {
            let mut entry = zip
                .by_index(index)
                .map_err(|e| ExtractError::Malformed(e.to_string()))?;
            let name = entry.name().to_string();
            let target = self.contained_join(&canonical_dest, &name)?;

            if entry.is_dir() {
                fs::create_dir_all(&target)?;
                continue;
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
            files_written += 1;

            // Stat what actually landed on disk; a symlink here means the
            // archive smuggled one past the header checks.
            let written = fs::symlink_metadata(&target)?;
            if written.file_type().is_symlink() {
                fs::remove_file(&target)?;
                warn!(path = %target.display(), "symlink written during extraction");
                self.audit.emit(AuditEvent::SymlinkDetected {
                    path: target.display().to_string(),
                });
                return Err(ExtractError::SymlinkDetected { entry: name });
            }
        }

        Ok(files_written)
    }

    /// Screen an entry name against traversal and forbidden-name rules.
    fn screen_name(&self, name: &str) -> Result<(), ExtractError> {
        if name.contains("..") {
            warn!(entry = name, "path traversal in archive entry");
            self.audit.emit(AuditEvent::PathTraversalAttempt {
                entry: name.to_string(),
            });
            return Err(ExtractError::PathTraversal {
                entry: name.to_string(),
            });
        }

        // The ".." pattern below is unreachable after the check above and
        // stays in the list as defense in depth.
        for pattern in &self.forbidden_patterns {
            if name.contains(pattern.as_str()) {
                self.audit.emit(AuditEvent::ForbiddenFileDetected {
                    entry: name.to_string(),
                });
                return Err(ExtractError::ForbiddenName {
                    entry: name.to_string(),
                });
            }
        }

        let leaf = name.trim_end_matches('/').rsplit('/').next().unwrap_or("");
        if leaf.starts_with('.') {
            self.audit.emit(AuditEvent::ForbiddenFileDetected {
                entry: name.to_string(),
            });
            return Err(ExtractError::ForbiddenName {
                entry: name.to_string(),
            });
        }

        Ok(())
    }

    /// Join an entry name under the canonical destination, rejecting any
    /// component that could escape it.
    fn contained_join(&self, canonical_dest: &Path, name: &str) -> Result<PathBuf, ExtractError> {
        let mut relative = PathBuf::new();
        for component in Path::new(name).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    self.audit.emit(AuditEvent::PathTraversalAttempt {
                        entry: name.to_string(),
                    });
                    return Err(ExtractError::PathTraversal {
                        entry: name.to_string(),
                    });
                }
            }
        }

        let joined = canonical_dest.join(relative);
        if !joined.starts_with(canonical_dest) {
            self.audit.emit(AuditEvent::PathTraversalAttempt {
                entry: name.to_string(),
            });
            return Err(ExtractError::PathTraversal {
                entry: name.to_string(),
            });
        }
        Ok(joined)
    }
}
