//! The per-attempt install state machine.
//!
//! One call to [`InstallOrchestrator::install_module`] drives one download
//! attempt through the stages
//!
//! ```text
//! CheckingNetwork → PreflightChecks → Downloading → VerifyingChecksum
//!   → Extracting → Installing → IntegrityCheck → Completed | Failed
//! ```
//!
//! Each attempt consumes exactly one coordinator reservation, and
//! `complete` is called exactly once for it with the mapped end reason.
//! The temp archive and staging directory are owned by a scoped guard, so
//! every terminating path — success, failure, cancellation, panic — releases
//! them; quarantine handoffs consume the path before the guard runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use caravel_audit::{AuditEvent, AuditSink};
use caravel_core::{InstallLayout, ModuleDescriptor, ModuleId};
use caravel_crypto::{ChecksumEngine, CryptoError};

use crate::coordinator::{AttemptId, DownloadCoordinator, DownloadEndReason};
use crate::disk::DiskSpaceChecker;
use crate::error::{DeliveryError, ExtractError, InstallError, NetworkError, SecurityError};
use crate::extract::SafeExtractor;
use crate::install::AtomicInstaller;
use crate::integrity::IntegrityValidator;
use crate::quarantine::QuarantineManager;
use crate::transport::{DownloadProgress, ModuleTransport, NetworkStatus};

/// Progress stages of one install attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadStage {
    /// Confirming connectivity.
    CheckingNetwork,
    /// Admission and disk-space checks.
    PreflightChecks,
    /// Streaming the archive.
    Downloading,
    /// Hashing the archive against the manifest checksum.
    VerifyingChecksum,
    /// Validating and extracting the archive.
    Extracting,
    /// Promoting the staging tree to its final directory.
    Installing,
    /// Re-auditing the installed tree.
    IntegrityCheck,
    /// The module is installed.
    Completed,
    /// The attempt terminated; carries a user-facing message.
    Failed(String),
}

/// A stage transition, as published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEvent {
    /// Module the attempt belongs to.
    pub module_id: ModuleId,
    /// Attempt token, once the coordinator granted one.
    pub attempt_id: Option<AttemptId>,
    /// The stage entered.
    pub stage: DownloadStage,
}

/// Scoped owner of the per-attempt scratch paths.
///
/// Paths may already be gone when the guard runs (consumed by a rename or
/// handed to quarantine); removal is best-effort by design.
struct AttemptWorkspace {
    archive: PathBuf,
    staging: PathBuf,
}

impl Drop for AttemptWorkspace {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.archive);
        let _ = std::fs::remove_dir_all(&self.staging);
    }
}

struct AttemptOutcome {
    result: Result<PathBuf, DeliveryError>,
    bytes_downloaded: u64,
    expected_bytes: Option<u64>,
}

/// Sequences one download attempt across all pipeline collaborators.
pub struct InstallOrchestrator {
    transport: Arc<dyn ModuleTransport>,
    coordinator: Arc<DownloadCoordinator>,
    extractor: Arc<SafeExtractor>,
    installer: Arc<AtomicInstaller>,
    integrity: Arc<IntegrityValidator>,
    quarantine: Arc<QuarantineManager>,
    disk: DiskSpaceChecker,
    checksum: ChecksumEngine,
    layout: InstallLayout,
    audit: AuditSink,
    stage_tx: Option<mpsc::UnboundedSender<StageEvent>>,
}

impl InstallOrchestrator {
    /// Wire an orchestrator over its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn ModuleTransport>,
        coordinator: Arc<DownloadCoordinator>,
        extractor: Arc<SafeExtractor>,
        installer: Arc<AtomicInstaller>,
        integrity: Arc<IntegrityValidator>,
        quarantine: Arc<QuarantineManager>,
        disk: DiskSpaceChecker,
        checksum: ChecksumEngine,
        layout: InstallLayout,
        audit: AuditSink,
        stage_tx: Option<mpsc::UnboundedSender<StageEvent>>,
    ) -> Self {
        Self {
            transport,
            coordinator,
            extractor,
            installer,
            integrity,
            quarantine,
            disk,
            checksum,
            layout,
            audit,
            stage_tx,
        }
    }

    /// Run one install attempt for `module`.
    ///
    /// # Errors
    ///
    /// Returns the typed [`DeliveryError`] for the stage that failed; the
    /// matching `Failed` stage event carries the user-facing message.
    pub async fn install_module(
        &self,
        module: &ModuleDescriptor,
        network: NetworkStatus,
        cancel: CancellationToken,
    ) -> Result<PathBuf, DeliveryError> {
        self.stage(module, None, DownloadStage::CheckingNetwork);
        if network == NetworkStatus::Offline {
            let error = DeliveryError::Network(NetworkError::Offline);
            self.stage(module, None, DownloadStage::Failed(error.user_message()));
            return Err(error);
        }

        self.stage(module, None, DownloadStage::PreflightChecks);
        let attempt_id = match self.coordinator.reserve(&module.id).await {
            Ok(id) => id,
            Err(e) => {
                let error = DeliveryError::Coordinator(e);
                self.stage(module, None, DownloadStage::Failed(error.user_message()));
                return Err(error);
            }
        };

        let outcome = self.run_attempt(module, attempt_id, &cancel).await;

        let end_reason = match &outcome.result {
            Ok(_) => DownloadEndReason::Success,
            Err(error) => end_reason_for(error),
        };
        self.coordinator
            .complete(
                &module.id,
                attempt_id,
                end_reason,
                outcome.bytes_downloaded,
                outcome.expected_bytes,
            )
            .await;

        match outcome.result {
            Ok(final_path) => {
                info!(module = %module.id, path = %final_path.display(), "install attempt completed");
                self.stage(module, Some(attempt_id), DownloadStage::Completed);
                Ok(final_path)
            }
            Err(error) => {
                warn!(module = %module.id, %error, "install attempt failed");
                self.stage(
                    module,
                    Some(attempt_id),
                    DownloadStage::Failed(error.user_message()),
                );
                Err(error)
            }
        }
    }

    async fn run_attempt(
        &self,
        module: &ModuleDescriptor,
        attempt_id: AttemptId,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let workspace = AttemptWorkspace {
            archive: self.layout.archive_path(attempt_id.as_uuid()),
            staging: self.layout.staging_dir(attempt_id.as_uuid()),
        };
        let mut bytes_downloaded = 0;
        let mut expected_bytes = None;

        let result = self
            .attempt_stages(
                module,
                attempt_id,
                cancel,
                &workspace,
                &mut bytes_downloaded,
                &mut expected_bytes,
            )
            .await;

        drop(workspace);
        AttemptOutcome {
            result,
            bytes_downloaded,
            expected_bytes,
        }
    }

    async fn attempt_stages(
        &self,
        module: &ModuleDescriptor,
        attempt_id: AttemptId,
        cancel: &CancellationToken,
        workspace: &AttemptWorkspace,
        bytes_downloaded: &mut u64,
        expected_bytes: &mut Option<u64>,
    ) -> Result<PathBuf, DeliveryError> {
        // Disk preflight happens before anything touches the disk.
        std::fs::create_dir_all(self.layout.documents_root())
            .map_err(|e| DeliveryError::Network(NetworkError::Io(e)))?;
        self.disk
            .ensure(self.layout.documents_root(), module.size_bytes)?;

        // Download straight into the per-attempt temp file, forwarding
        // progress samples to the coordinator.
        self.stage(module, Some(attempt_id), DownloadStage::Downloading);
        if let Some(parent) = workspace.archive.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DeliveryError::Network(NetworkError::Io(e)))?;
        }
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<DownloadProgress>();
        let forwarder = {
            let coordinator = Arc::clone(&self.coordinator);
            let module_id = module.id.clone();
            tokio::spawn(async move {
                while let Some(sample) = progress_rx.recv().await {
                    coordinator
                        .update_progress(
                            &module_id,
                            attempt_id,
                            sample.bytes_received,
                            sample.expected_bytes,
                        )
                        .await;
                }
            })
        };
        let downloaded = self
            .transport
            .download(
                &module.download_url,
                &workspace.archive,
                Some(progress_tx),
                cancel,
            )
            .await;
        let _ = forwarder.await;
        let downloaded = downloaded.map_err(DeliveryError::Network)?;
        *bytes_downloaded = downloaded.bytes_written;
        *expected_bytes = downloaded.expected_bytes;
        ensure_live(cancel)?;

        // Checksum over the archive bytes, off the async workers.
        self.stage(module, Some(attempt_id), DownloadStage::VerifyingChecksum);
        let engine = self.checksum;
        let archive = workspace.archive.clone();
        let expected_hex = module.checksum_hex.clone();
        let verified = run_blocking(move || engine.verify_file(&archive, &expected_hex))
            .await
            .map_err(|e| DeliveryError::Security(SecurityError::Crypto(CryptoError::Io(e))))?;
        match verified {
            Ok(size_bytes) => {
                self.audit.emit(AuditEvent::ChecksumVerified {
                    algorithm: engine.algorithm(),
                    size_bytes,
                });
            }
            Err(CryptoError::ChecksumMismatch {
                expected, actual, ..
            }) => {
                self.audit.emit(AuditEvent::ChecksumMismatch {
                    module_id: module.id.clone(),
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
                self.quarantine_archive(module, &workspace.archive, "Checksum mismatch")
                    .await;
                return Err(DeliveryError::Security(SecurityError::ChecksumMismatch {
                    module_id: module.id.clone(),
                    expected,
                    actual,
                }));
            }
            Err(e) => return Err(DeliveryError::Security(SecurityError::Crypto(e))),
        }
        ensure_live(cancel)?;

        // Validate and extract into the per-attempt staging directory.
        self.stage(module, Some(attempt_id), DownloadStage::Extracting);
        let extractor = Arc::clone(&self.extractor);
        let archive = workspace.archive.clone();
        let staging = workspace.staging.clone();
        let extracted = run_blocking(move || extractor.extract(&archive, &staging))
            .await
            .map_err(|e| {
                DeliveryError::Security(SecurityError::Extraction(ExtractError::Io(e)))
            })?;
        if let Err(e) = extracted {
            self.quarantine_archive(module, &workspace.archive, &e.to_string())
                .await;
            return Err(DeliveryError::Security(SecurityError::Extraction(e)));
        }
        ensure_live(cancel)?;

        // Promote the staging tree.
        self.stage(module, Some(attempt_id), DownloadStage::Installing);
        let installer = Arc::clone(&self.installer);
        let staging = workspace.staging.clone();
        let name = module.name.clone();
        let version = module.version.clone();
        let final_path = run_blocking(move || installer.install(&staging, &name, &version))
            .await
            .map_err(|e| {
                DeliveryError::Install(InstallError::InstallationFailed {
                    module: module.name.clone(),
                    version: module.version.clone(),
                    detail: e.to_string(),
                })
            })?
            .map_err(DeliveryError::Install)?;

        // Final re-audit of what landed on disk.
        self.stage(module, Some(attempt_id), DownloadStage::IntegrityCheck);
        if let Err(e) = self.integrity.validate(&module.name, &final_path) {
            let _ = std::fs::remove_dir_all(&final_path);
            return Err(DeliveryError::Integrity(e));
        }

        Ok(final_path)
    }

    async fn quarantine_archive(&self, module: &ModuleDescriptor, archive: &Path, reason: &str) {
        if let Err(e) = self.quarantine.quarantine(&module.id, archive, reason).await {
            warn!(module = %module.id, error = %e, "failed to quarantine archive");
        }
    }

    fn stage(&self, module: &ModuleDescriptor, attempt_id: Option<AttemptId>, stage: DownloadStage) {
        debug!(module = %module.id, ?stage, "stage transition");
        if let Some(tx) = &self.stage_tx {
            let _ = tx.send(StageEvent {
                module_id: module.id.clone(),
                attempt_id,
                stage,
            });
        }
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), DeliveryError> {
    if cancel.is_cancelled() {
        Err(DeliveryError::Network(NetworkError::Cancelled))
    } else {
        Ok(())
    }
}

/// Map a terminating error to the coordinator's end reason.
fn end_reason_for(error: &DeliveryError) -> DownloadEndReason {
    match error {
        DeliveryError::Network(NetworkError::Offline) => DownloadEndReason::NoInternet,
        DeliveryError::Network(NetworkError::Timeout) => DownloadEndReason::Timeout,
        DeliveryError::Network(NetworkError::Cancelled) => DownloadEndReason::Cancelled,
        DeliveryError::Network(NetworkError::ServerError { status }) => {
            DownloadEndReason::ServerError(Some(*status))
        }
        DeliveryError::Security(SecurityError::ChecksumMismatch { .. }) => {
            DownloadEndReason::ChecksumMismatch
        }
        DeliveryError::Integrity(_) => DownloadEndReason::IntegrityFailed,
        _ => DownloadEndReason::Unknown,
    }
}

/// Run CPU- or fs-heavy work on the blocking pool.
async fn run_blocking<T, F>(f: F) -> std::io::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(std::io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_reason_mapping() {
        assert_eq!(
            end_reason_for(&DeliveryError::Network(NetworkError::Offline)),
            DownloadEndReason::NoInternet
        );
        assert_eq!(
            end_reason_for(&DeliveryError::Network(NetworkError::Timeout)),
            DownloadEndReason::Timeout
        );
        assert_eq!(
            end_reason_for(&DeliveryError::Network(NetworkError::ServerError {
                status: 503
            })),
            DownloadEndReason::ServerError(Some(503))
        );
        assert_eq!(
            end_reason_for(&DeliveryError::Security(SecurityError::ChecksumMismatch {
                module_id: ModuleId::new("m").unwrap(),
                expected: "a".into(),
                actual: "b".into(),
            })),
            DownloadEndReason::ChecksumMismatch
        );
        assert_eq!(
            end_reason_for(&DeliveryError::Integrity(
                crate::error::IntegrityError::Empty {
                    path: PathBuf::from("/x"),
                }
            )),
            DownloadEndReason::IntegrityFailed
        );
        assert_eq!(
            end_reason_for(&DeliveryError::Security(SecurityError::Extraction(
                ExtractError::PathTraversal {
                    entry: "../x".into()
                }
            ))),
            DownloadEndReason::Unknown
        );
    }
}
