//! Delivery pipeline error types.
//!
//! The top-level surface is a closed sum over the collaborator error kinds;
//! callers pattern-match variants, never strings. User-facing text comes from
//! the `Display` derivations and is a derived view, not the contract.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use caravel_core::{Environment, ModuleId};

/// Top-level error surface of the delivery pipeline.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Transport-level failure.
    #[error(transparent)]
    Network(#[from] NetworkError),
    /// A security control rejected the attempt.
    #[error(transparent)]
    Security(#[from] SecurityError),
    /// The manifest was rejected.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    /// The download coordinator refused the attempt.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    /// The atomic installer failed (after rolling back).
    #[error(transparent)]
    Install(#[from] InstallError),
    /// The installed tree failed its integrity check.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

impl DeliveryError {
    /// User-facing, localization-ready failure message for stage reporting.
    #[must_use]
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

/// Transport failures. Recoverable: callers may retry after the cooldown.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// No connectivity.
    #[error("no internet connection")]
    Offline,
    /// The request or resource timeout elapsed.
    #[error("download timed out")]
    Timeout,
    /// The attempt was cancelled.
    #[error("download cancelled")]
    Cancelled,
    /// The server answered with a non-2xx status.
    #[error("server error (status {status})")]
    ServerError {
        /// HTTP status code.
        status: u16,
    },
    /// The download URL is malformed.
    #[error("invalid download URL: {0}")]
    BadUrl(String),
    /// A redirect pointed outside the origin of the original request.
    #[error("cross-origin redirect blocked: {url}")]
    RedirectBlocked {
        /// The blocked redirect target.
        url: String,
    },
    /// The response body exceeded the archive byte cap mid-stream.
    #[error("response too large: {received} bytes (limit {limit})")]
    ResponseTooLarge {
        /// Bytes received before aborting.
        received: u64,
        /// Configured cap.
        limit: u64,
    },
    /// Any other HTTP-level failure.
    #[error("transport error: {0}")]
    Http(String),
    /// Local I/O failure while writing the download.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A security control rejected the attempt. Fatal for this attempt.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// Archive digest did not match the manifest checksum.
    #[error("checksum mismatch for module '{module_id}'")]
    ChecksumMismatch {
        /// Module whose archive failed.
        module_id: ModuleId,
        /// Expected hex digest.
        expected: String,
        /// Actual hex digest.
        actual: String,
    },
    /// Archive validation or extraction failed.
    #[error(transparent)]
    Extraction(#[from] ExtractError),
    /// Cryptographic primitive failure.
    #[error(transparent)]
    Crypto(#[from] caravel_crypto::CryptoError),
    /// Not enough free disk space to start the download.
    #[error("insufficient disk space: need {required} bytes, {available} available")]
    InsufficientDiskSpace {
        /// Required bytes (archive size × safety factor).
        required: u64,
        /// Available bytes.
        available: u64,
    },
}

/// Manifest rejection reasons.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest JSON could not be parsed.
    #[error("malformed manifest: {0}")]
    Malformed(String),
    /// The timestamp string is not valid ISO-8601.
    #[error("invalid manifest timestamp '{0}'")]
    InvalidTimestamp(String),
    /// The timestamp is further in the future than the skew allowance.
    #[error("manifest timestamp is {skew_secs}s in the future")]
    TimestampInFuture {
        /// Forward skew in seconds.
        skew_secs: i64,
    },
    /// The manifest is older than the replay window.
    #[error("manifest is too old ({age_secs}s)")]
    TooOld {
        /// Manifest age in seconds.
        age_secs: i64,
    },
    /// The nonce is shorter than the minimum length.
    #[error("manifest nonce too short ({length} chars)")]
    InvalidNonce {
        /// Actual nonce length.
        length: usize,
    },
    /// The signature did not verify.
    #[error("invalid manifest signature: {0}")]
    InvalidSignature(String),
    /// The manifest was published for a different environment.
    #[error("environment mismatch: expected {expected}, manifest is for {actual}")]
    EnvironmentMismatch {
        /// This client's environment.
        expected: Environment,
        /// The manifest's environment.
        actual: String,
    },
}

/// Download coordinator policy rejections. Recoverable.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The concurrency gate is full.
    #[error("too many concurrent downloads (limit {limit})")]
    TooManyConcurrentDownloads {
        /// Configured concurrency limit.
        limit: usize,
    },
    /// The module already has an active attempt.
    #[error("download already in progress for '{0}'")]
    DownloadAlreadyInProgress(ModuleId),
    /// The per-module cooldown has not elapsed.
    #[error("rate limit exceeded; retry in {retry_after:?}")]
    RateLimitExceeded {
        /// Remaining cooldown.
        retry_after: Duration,
    },
    /// The rolling hourly quota is exhausted.
    #[error("download quota exceeded ({limit} per hour)")]
    DownloadQuotaExceeded {
        /// Configured hourly quota.
        limit: usize,
    },
}

/// Archive validation and extraction failures. Fatal for this attempt.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Archive byte size exceeds the cap.
    #[error("archive too large: {size} bytes (limit {limit})")]
    ArchiveTooLarge {
        /// Archive size in bytes.
        size: u64,
        /// Configured cap.
        limit: u64,
    },
    /// Entry count exceeds the cap.
    #[error("too many archive entries: {count} (limit {limit})")]
    TooManyEntries {
        /// Entry count.
        count: usize,
        /// Configured cap.
        limit: usize,
    },
    /// An entry path escapes the destination root.
    #[error("path traversal detected in entry '{entry}'")]
    PathTraversal {
        /// The offending entry path.
        entry: String,
    },
    /// An entry matched the forbidden-name rules (including hidden files).
    #[error("forbidden file name in entry '{entry}'")]
    ForbiddenName {
        /// The offending entry path.
        entry: String,
    },
    /// A file entry has an extension outside the allowed set.
    #[error("unsupported file type '{extension}' in entry '{entry}'")]
    UnsupportedFileType {
        /// The offending entry path.
        entry: String,
        /// The rejected extension (lowercased).
        extension: String,
    },
    /// A single entry's declared size exceeds the cap.
    #[error("entry '{entry}' too large: {size} bytes (limit {limit})")]
    EntryTooLarge {
        /// The offending entry path.
        entry: String,
        /// Declared uncompressed size.
        size: u64,
        /// Configured cap.
        limit: u64,
    },
    /// Declared uncompressed total exceeds the zip-bomb cap.
    #[error("total uncompressed size {declared} exceeds limit {limit}")]
    TotalSizeExceeded {
        /// Declared total uncompressed size.
        declared: u64,
        /// Configured cap.
        limit: u64,
    },
    /// An entry is a symbolic link (header metadata or written result).
    #[error("symlink detected at '{entry}'")]
    SymlinkDetected {
        /// The offending entry or path.
        entry: String,
    },
    /// The archive is not a readable ZIP.
    #[error("malformed archive: {0}")]
    Malformed(String),
    /// Filesystem failure during extraction.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Atomic installer failure (internal rollback already ran).
#[derive(Debug, Error)]
pub enum InstallError {
    /// The install could not be completed; prior state was restored.
    #[error("installation failed for {module} {version}: {detail}")]
    InstallationFailed {
        /// Module name.
        module: String,
        /// Version being installed.
        version: String,
        /// Failure detail.
        detail: String,
    },
}

/// Installed-tree integrity failures.
#[derive(Debug, Error)]
pub enum IntegrityError {
    /// The module directory does not exist.
    #[error("module path missing: {path}")]
    Missing {
        /// Expected module path.
        path: PathBuf,
    },
    /// The module path is not a directory.
    #[error("module path is not a directory: {path}")]
    NotADirectory {
        /// Offending path.
        path: PathBuf,
    },
    /// The module directory is empty.
    #[error("module directory is empty: {path}")]
    Empty {
        /// Offending path.
        path: PathBuf,
    },
    /// A symlink was found inside the installed tree.
    #[error("symlink found in installed tree: {path}")]
    SymlinkFound {
        /// Path of the symlink.
        path: PathBuf,
    },
    /// Filesystem failure during validation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Quarantine manager failures.
#[derive(Debug, Error)]
pub enum QuarantineError {
    /// No quarantine entry exists for the module.
    #[error("module '{0}' is not in quarantine")]
    NotInQuarantine(ModuleId),
    /// Filesystem failure while moving or deleting artifacts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for the top-level surface.
pub type DeliveryResult<T> = Result<T, DeliveryError>;
