//! Composition root for the delivery pipeline.
//!
//! Constructs each collaborator exactly once and injects it — there is no
//! process-wide state, so tests instantiate as many pipelines as they like
//! with fake transports, clocks, and disk probes.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use caravel_audit::{AuditEvent, AuditSink};
use caravel_core::{Clock, InstallLayout, ModuleDescriptor, SecurityConfig, SystemClock};
use caravel_crypto::{CertificatePinner, ChecksumEngine, PinningDecision, SignatureVerifier};

use crate::coordinator::DownloadCoordinator;
use crate::disk::{DiskProbe, DiskSpaceChecker, SystemDiskProbe};
use crate::error::{DeliveryError, DeliveryResult, NetworkError};
use crate::extract::SafeExtractor;
use crate::install::AtomicInstaller;
use crate::integrity::IntegrityValidator;
use crate::manifest::{ManifestValidator, ValidatedManifest};
use crate::orchestrator::{InstallOrchestrator, StageEvent};
use crate::quarantine::QuarantineManager;
use crate::transport::{HttpTransport, ModuleTransport, NetworkStatus};

/// Builder for a [`DeliveryPipeline`].
pub struct DeliveryPipelineBuilder {
    config: SecurityConfig,
    layout: InstallLayout,
    transport: Option<Arc<dyn ModuleTransport>>,
    clock: Arc<dyn Clock>,
    disk_probe: Arc<dyn DiskProbe>,
    audit: Option<AuditSink>,
    verifier: Option<SignatureVerifier>,
    stage_tx: Option<mpsc::UnboundedSender<StageEvent>>,
}

impl DeliveryPipelineBuilder {
    /// Start a builder over a configuration and install layout.
    #[must_use]
    pub fn new(config: SecurityConfig, layout: InstallLayout) -> Self {
        Self {
            config,
            layout,
            transport: None,
            clock: Arc::new(SystemClock),
            disk_probe: Arc::new(SystemDiskProbe),
            audit: None,
            verifier: None,
            stage_tx: None,
        }
    }

    /// Inject a transport (defaults to [`HttpTransport`] from the config).
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn ModuleTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Inject a clock (defaults to the system clock).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Inject a disk probe (defaults to the platform probe).
    #[must_use]
    pub fn with_disk_probe(mut self, probe: Arc<dyn DiskProbe>) -> Self {
        self.disk_probe = probe;
        self
    }

    /// Inject an audit sink (defaults to the `tracing` sink).
    #[must_use]
    pub fn with_audit(mut self, audit: AuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Inject a manifest verifier (defaults to the compiled-in key).
    #[must_use]
    pub fn with_verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Subscribe a channel to stage events.
    #[must_use]
    pub fn with_stage_events(mut self, tx: mpsc::UnboundedSender<StageEvent>) -> Self {
        self.stage_tx = Some(tx);
        self
    }

    /// Wire the pipeline.
    ///
    /// # Errors
    ///
    /// Fails if the compiled-in public key is corrupt, the HTTP client
    /// cannot be built, or the quarantine directory cannot be created.
    pub fn build(self) -> DeliveryResult<DeliveryPipeline> {
        let audit = match self.audit {
            Some(audit) => audit,
            None => AuditSink::tracing(),
        };
        let verifier = match self.verifier {
            Some(verifier) => verifier,
            None => SignatureVerifier::builtin()
                .map_err(|e| DeliveryError::Security(e.into()))?,
        };
        let pinner = CertificatePinner::new(
            self.config.pinning.pins.clone(),
            self.config.pinning.allow_insecure_localhost,
        );
        let transport: Arc<dyn ModuleTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(
                &self.config,
                pinner.clone(),
                audit.clone(),
            )?),
        };

        let coordinator = Arc::new(DownloadCoordinator::new(
            &self.config,
            Arc::clone(&self.clock),
            audit.clone(),
        ));
        let quarantine = Arc::new(
            QuarantineManager::open(
                self.layout.quarantine_dir(),
                Arc::clone(&self.clock),
                audit.clone(),
            )
            .map_err(|e| DeliveryError::Network(NetworkError::Io(e)))?,
        );
        let validator = ManifestValidator::new(&self.config, verifier, audit.clone());
        let orchestrator = InstallOrchestrator::new(
            Arc::clone(&transport),
            Arc::clone(&coordinator),
            Arc::new(SafeExtractor::new(&self.config, audit.clone())),
            Arc::new(AtomicInstaller::new(self.layout.clone(), audit.clone())),
            Arc::new(IntegrityValidator::new(audit.clone())),
            Arc::clone(&quarantine),
            DiskSpaceChecker::new(&self.config, self.disk_probe, audit.clone()),
            ChecksumEngine::new(self.config.checksum_algorithm),
            self.layout.clone(),
            audit.clone(),
            self.stage_tx,
        );

        Ok(DeliveryPipeline {
            transport,
            validator,
            orchestrator,
            coordinator,
            quarantine,
            integrity: IntegrityValidator::new(audit.clone()),
            pinner,
            layout: self.layout,
            clock: self.clock,
            audit,
        })
    }
}

/// The wired delivery pipeline.
pub struct DeliveryPipeline {
    transport: Arc<dyn ModuleTransport>,
    validator: ManifestValidator,
    orchestrator: InstallOrchestrator,
    coordinator: Arc<DownloadCoordinator>,
    quarantine: Arc<QuarantineManager>,
    integrity: IntegrityValidator,
    pinner: CertificatePinner,
    layout: InstallLayout,
    clock: Arc<dyn Clock>,
    audit: AuditSink,
}

impl DeliveryPipeline {
    /// Fetch and validate the signed manifest.
    ///
    /// # Errors
    ///
    /// Surfaces transport failures and manifest rejections.
    pub async fn fetch_manifest(&self) -> DeliveryResult<ValidatedManifest> {
        let envelope = self.transport.fetch_manifest().await?;
        Ok(self.validator.validate(&envelope, self.clock.now())?)
    }

    /// Run one install attempt for `module`.
    ///
    /// # Errors
    ///
    /// Surfaces the typed error of the stage that failed.
    pub async fn install(
        &self,
        module: &ModuleDescriptor,
        network: NetworkStatus,
        cancel: CancellationToken,
    ) -> DeliveryResult<PathBuf> {
        self.orchestrator.install_module(module, network, cancel).await
    }

    /// Periodic integrity sweep over every installed module.
    pub fn integrity_sweep(
        &self,
    ) -> Vec<(String, Result<crate::integrity::IntegrityReport, crate::error::IntegrityError>)>
    {
        self.integrity.sweep(&self.layout.modules_dir())
    }

    /// The download coordinator (statistics, history).
    #[must_use]
    pub fn coordinator(&self) -> &Arc<DownloadCoordinator> {
        &self.coordinator
    }

    /// The quarantine manager (list, release, delete).
    #[must_use]
    pub fn quarantine(&self) -> &Arc<QuarantineManager> {
        &self.quarantine
    }

    /// The certificate pinner, for wiring into the TLS stack's challenge
    /// callback.
    #[must_use]
    pub fn pinner(&self) -> &CertificatePinner {
        &self.pinner
    }

    /// Decide a server-trust challenge and record the outcome.
    ///
    /// The built-in [`crate::transport::HttpTransport`] already enforces
    /// pinning on its own handshakes; a custom [`crate::transport::ModuleTransport`]
    /// with its own TLS stack should route its challenge hook through this
    /// so rejections still produce audit events.
    #[must_use]
    pub fn evaluate_server_trust(&self, host: &str, leaf_der: Option<&[u8]>) -> PinningDecision {
        let decision = self.pinner.evaluate(host, leaf_der);
        match &decision {
            PinningDecision::AcceptPinned { spki_hash } => {
                self.audit.emit(AuditEvent::CertificatePinningSuccess {
                    spki_hash: spki_hash.clone(),
                });
            }
            PinningDecision::Reject { reason } => {
                self.audit.emit(AuditEvent::CertificatePinningFailed {
                    host: host.to_string(),
                    reason: reason.clone(),
                });
            }
            PinningDecision::UseSystemTrust => {}
        }
        decision
    }
}
