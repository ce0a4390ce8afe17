//! Caravel Delivery - the client-side secure module delivery pipeline.
//!
//! Given an untrusted remote source of module bundles, this crate fetches,
//! authenticates, verifies, extracts, installs, and audits them such that a
//! compromised server cannot corrupt the local installation, escape the
//! install root, exhaust resources, replay stale manifests, or leave the
//! installation half-applied.
//!
//! The pieces, bottom up:
//! - [`manifest`]: signed manifest parsing, canonical-body signature checks,
//!   freshness and nonce gates
//! - [`coordinator`]: concurrency, cooldown, and quota admission plus attempt
//!   bookkeeping
//! - [`transport`]: the remote-source capability trait and its HTTP
//!   implementation
//! - [`disk`]: free-space preflight
//! - [`extract`]: two-pass ZIP validation and containment-checked extraction
//! - [`install`]: atomic backup/promote/rollback installation
//! - [`integrity`]: post-install tree re-auditing
//! - [`quarantine`]: isolation of suspect artifacts
//! - [`orchestrator`]: the per-attempt state machine tying it all together
//! - [`pipeline`]: the composition root

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod coordinator;
pub mod disk;
pub mod error;
pub mod extract;
pub mod install;
pub mod integrity;
pub mod manifest;
pub mod orchestrator;
pub mod pipeline;
pub mod quarantine;
mod tls;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use coordinator::{
    AttemptId, DownloadCoordinator, DownloadEndReason, DownloadRecord, DownloadStats,
};
pub use disk::{DiskProbe, DiskSpaceChecker, SystemDiskProbe};
pub use error::{
    CoordinatorError, DeliveryError, DeliveryResult, ExtractError, InstallError, IntegrityError,
    ManifestError, NetworkError, QuarantineError, SecurityError,
};
pub use extract::{ExtractionSummary, SafeExtractor};
pub use install::AtomicInstaller;
pub use integrity::{IntegrityReport, IntegrityValidator};
pub use manifest::{ManifestEnvelope, ManifestValidator, ValidatedManifest, canonical_body_bytes};
pub use orchestrator::{DownloadStage, InstallOrchestrator, StageEvent};
pub use pipeline::{DeliveryPipeline, DeliveryPipelineBuilder};
pub use quarantine::{QuarantineEntry, QuarantineManager};
pub use transport::{
    DownloadProgress, DownloadedArchive, HttpTransport, ModuleTransport, NetworkStatus,
};
