//! Disk-space preflight.
//!
//! Before any bytes hit the disk, the checker requires a free-space multiple
//! of the archive size (staging + final + safety margin). A probe failure is
//! treated as no space at all: the preflight fails closed.

use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use caravel_audit::{AuditEvent, AuditSink};
use caravel_core::SecurityConfig;

use crate::error::SecurityError;

/// Source of free-space measurements.
pub trait DiskProbe: Send + Sync + std::fmt::Debug {
    /// Free bytes on the filesystem holding `path`.
    fn available_bytes(&self, path: &Path) -> std::io::Result<u64>;
}

/// Probe backed by the platform's statvfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDiskProbe;

impl DiskProbe for SystemDiskProbe {
    fn available_bytes(&self, path: &Path) -> std::io::Result<u64> {
        fs2::available_space(path)
    }
}

/// Verifies sufficient free space before a download starts.
#[derive(Debug, Clone)]
pub struct DiskSpaceChecker {
    probe: Arc<dyn DiskProbe>,
    factor: u64,
    audit: AuditSink,
}

impl DiskSpaceChecker {
    /// Build a checker from configuration.
    #[must_use]
    pub fn new(config: &SecurityConfig, probe: Arc<dyn DiskProbe>, audit: AuditSink) -> Self {
        Self {
            probe,
            factor: config.limits.disk_space_factor,
            audit,
        }
    }

    /// Require `archive_size × factor` free bytes under `root`.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InsufficientDiskSpace`]; nothing has been
    /// written when it does.
    pub fn ensure(&self, root: &Path, archive_size: u64) -> Result<(), SecurityError> {
        let required = archive_size.saturating_mul(self.factor);
        let available = match self.probe.available_bytes(root) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "disk probe failed; failing closed");
                0
            }
        };

        if available < required {
            self.audit.emit(AuditEvent::InsufficientDiskSpace {
                required,
                available,
            });
            return Err(SecurityError::InsufficientDiskSpace {
                required,
                available,
            });
        }
        Ok(())
    }
}
