//! Audit event taxonomy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use caravel_core::{ChecksumAlgorithm, ModuleId};

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Expected, successful operation.
    Info,
    /// Notable but routine policy decision (rate limit, disk pressure).
    Default,
    /// An operation failed; the pipeline recovered or rolled back.
    Error,
    /// Evidence of an attack or a broken security control.
    Fault,
}

/// Security-relevant events emitted by the delivery pipeline.
///
/// The set is closed: sinks exhaustively match on it, so adding a variant is
/// a reviewed API change rather than a stringly-typed log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Manifest signature verified.
    SignatureVerified {
        /// Signature algorithm identifier.
        algorithm: String,
    },
    /// Manifest signature failed to verify.
    SignatureVerificationFailed {
        /// Failure detail.
        detail: String,
    },
    /// A manifest was rejected because of its signature.
    InvalidSignatureDetected {
        /// Rejection detail.
        detail: String,
    },

    /// Archive checksum verified.
    ChecksumVerified {
        /// Digest algorithm.
        algorithm: ChecksumAlgorithm,
        /// Bytes hashed.
        size_bytes: u64,
    },
    /// Archive checksum did not match the manifest.
    ChecksumMismatch {
        /// Module whose archive failed.
        module_id: ModuleId,
        /// Expected hex digest.
        expected: String,
        /// Actual hex digest.
        actual: String,
    },

    /// Server certificate pin matched.
    CertificatePinningSuccess {
        /// Base64 SHA-256 of the matched SPKI.
        spki_hash: String,
    },
    /// Server certificate pinning failed.
    CertificatePinningFailed {
        /// Remote host.
        host: String,
        /// Rejection reason.
        reason: String,
    },

    /// Archive entry attempted to escape the staging root.
    PathTraversalAttempt {
        /// The offending entry path.
        entry: String,
    },
    /// A symbolic link was found where none is allowed.
    SymlinkDetected {
        /// Path or entry name of the symlink.
        path: String,
    },
    /// Archive entry matched the forbidden-name rules.
    ForbiddenFileDetected {
        /// The offending entry path.
        entry: String,
    },
    /// Declared uncompressed total exceeded the zip-bomb cap.
    ZipBombDetected {
        /// Declared total uncompressed size in bytes.
        declared_total: u64,
    },

    /// Module installed and promoted to its final directory.
    InstallationSuccess {
        /// Module name.
        module: String,
        /// Installed version.
        version: String,
    },
    /// Install failed; any partial state was rolled back.
    InstallationFailed {
        /// Module name.
        module: String,
        /// Failure detail.
        detail: String,
    },
    /// A backup was restored over a failed install.
    RollbackPerformed {
        /// Module name.
        module: String,
    },

    /// Manifest was older than the replay window.
    ReplayAttemptDetected {
        /// Manifest age in seconds.
        age_secs: i64,
    },
    /// Manifest timestamp was ahead of the local clock.
    ManifestTimestampInFuture {
        /// Forward skew in seconds.
        skew_secs: i64,
    },
    /// A download was refused by the per-module cooldown.
    RateLimitExceeded {
        /// Module that was refused.
        module_id: ModuleId,
        /// Remaining cooldown.
        retry_after: Duration,
    },

    /// An artifact was moved into quarantine.
    ModuleQuarantined {
        /// Module the artifact belongs to.
        module_id: ModuleId,
        /// Why it was quarantined.
        reason: String,
    },
    /// A quarantined artifact was restored to its original location.
    QuarantineReleased {
        /// Module the artifact belongs to.
        module_id: ModuleId,
    },

    /// Installed tree passed its integrity check.
    IntegrityCheckPassed {
        /// Module name.
        module: String,
    },
    /// Installed tree failed its integrity check.
    IntegrityCheckFailed {
        /// Module name.
        module: String,
        /// Failure reason.
        reason: String,
    },

    /// Not enough free disk space to start a download.
    InsufficientDiskSpace {
        /// Bytes required (archive size × safety factor).
        required: u64,
        /// Bytes available.
        available: u64,
    },
}

impl AuditEvent {
    /// Severity of this event.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::SignatureVerified { .. }
            | Self::ChecksumVerified { .. }
            | Self::CertificatePinningSuccess { .. }
            | Self::InstallationSuccess { .. }
            | Self::QuarantineReleased { .. }
            | Self::IntegrityCheckPassed { .. } => Severity::Info,

            Self::RateLimitExceeded { .. } | Self::InsufficientDiskSpace { .. } => {
                Severity::Default
            }

            Self::ChecksumMismatch { .. }
            | Self::ZipBombDetected { .. }
            | Self::InstallationFailed { .. }
            | Self::RollbackPerformed { .. }
            | Self::IntegrityCheckFailed { .. } => Severity::Error,

            Self::SignatureVerificationFailed { .. }
            | Self::InvalidSignatureDetected { .. }
            | Self::CertificatePinningFailed { .. }
            | Self::PathTraversalAttempt { .. }
            | Self::SymlinkDetected { .. }
            | Self::ForbiddenFileDetected { .. }
            | Self::ReplayAttemptDetected { .. }
            | Self::ManifestTimestampInFuture { .. }
            | Self::ModuleQuarantined { .. } => Severity::Fault,
        }
    }

    /// Stable event kind name for log lines and file sinks.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SignatureVerified { .. } => "signature_verified",
            Self::SignatureVerificationFailed { .. } => "signature_verification_failed",
            Self::InvalidSignatureDetected { .. } => "invalid_signature_detected",
            Self::ChecksumVerified { .. } => "checksum_verified",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::CertificatePinningSuccess { .. } => "certificate_pinning_success",
            Self::CertificatePinningFailed { .. } => "certificate_pinning_failed",
            Self::PathTraversalAttempt { .. } => "path_traversal_attempt",
            Self::SymlinkDetected { .. } => "symlink_detected",
            Self::ForbiddenFileDetected { .. } => "forbidden_file_detected",
            Self::ZipBombDetected { .. } => "zip_bomb_detected",
            Self::InstallationSuccess { .. } => "installation_success",
            Self::InstallationFailed { .. } => "installation_failed",
            Self::RollbackPerformed { .. } => "rollback_performed",
            Self::ReplayAttemptDetected { .. } => "replay_attempt_detected",
            Self::ManifestTimestampInFuture { .. } => "manifest_timestamp_in_future",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::ModuleQuarantined { .. } => "module_quarantined",
            Self::QuarantineReleased { .. } => "quarantine_released",
            Self::IntegrityCheckPassed { .. } => "integrity_check_passed",
            Self::IntegrityCheckFailed { .. } => "integrity_check_failed",
            Self::InsufficientDiskSpace { .. } => "insufficient_disk_space",
        }
    }
}

/// A timestamped, severity-tagged event as delivered to backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the event was emitted.
    pub at: DateTime<Utc>,
    /// Derived severity.
    pub severity: Severity,
    /// The event itself.
    pub event: AuditEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping() {
        assert_eq!(
            AuditEvent::SignatureVerified {
                algorithm: "x".into()
            }
            .severity(),
            Severity::Info
        );
        assert_eq!(
            AuditEvent::RateLimitExceeded {
                module_id: ModuleId::new("m").unwrap(),
                retry_after: Duration::from_secs(3),
            }
            .severity(),
            Severity::Default
        );
        assert_eq!(
            AuditEvent::ChecksumMismatch {
                module_id: ModuleId::new("m").unwrap(),
                expected: "a".into(),
                actual: "b".into(),
            }
            .severity(),
            Severity::Error
        );
        assert_eq!(
            AuditEvent::PathTraversalAttempt {
                entry: "../etc/passwd".into()
            }
            .severity(),
            Severity::Fault
        );
        assert_eq!(
            AuditEvent::ModuleQuarantined {
                module_id: ModuleId::new("m").unwrap(),
                reason: "checksum".into(),
            }
            .severity(),
            Severity::Fault
        );
        assert_eq!(
            AuditEvent::QuarantineReleased {
                module_id: ModuleId::new("m").unwrap(),
            }
            .severity(),
            Severity::Info
        );
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let json = serde_json::to_value(AuditEvent::ZipBombDetected {
            declared_total: 101,
        })
        .unwrap();
        assert_eq!(json["kind"], "zip_bomb_detected");
        assert_eq!(json["declared_total"], 101);
    }
}
