//! Security configuration for the delivery pipeline.
//!
//! Every section implements [`Default`] with the production-safe values, so a
//! bare `[section]` header in TOML produces a working configuration. Loaded
//! from TOML files or constructed in code (tests override individual knobs).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::{ChecksumAlgorithm, Environment};

/// Root security configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Environment this client runs in; manifests must match when
    /// `manifest.enforce_environment_match` is set.
    pub environment: Environment,
    /// Digest algorithm for archive checksum verification.
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Size and count caps.
    pub limits: LimitsConfig,
    /// Download coordination knobs.
    pub downloads: DownloadConfig,
    /// Manifest freshness and signature policy.
    pub manifest: ManifestConfig,
    /// Archive extraction filters.
    pub extraction: ExtractionConfig,
    /// Certificate pinning policy.
    pub pinning: PinningConfig,
}

impl SecurityConfig {
    /// Parse a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigParse`] on malformed TOML.
    pub fn from_toml_str(s: &str) -> CoreResult<Self> {
        toml::from_str(s).map_err(|e| CoreError::ConfigParse(e.to_string()))
    }

    /// Load a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigIo`] if the file cannot be read and
    /// [`CoreError::ConfigParse`] on malformed TOML.
    pub fn from_toml_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }
}

/// Size and count caps for downloaded archives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum archive size in bytes.
    pub max_download_size: u64,
    /// Maximum total uncompressed size across all entries (zip-bomb guard).
    pub max_uncompressed_size: u64,
    /// Maximum declared uncompressed size of a single entry.
    pub max_individual_file_size: u64,
    /// Maximum number of entries per archive.
    pub max_file_count: usize,
    /// Free-space multiple required before a download starts.
    pub disk_space_factor: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_download_size: 50 * 1024 * 1024,
            max_uncompressed_size: 100 * 1024 * 1024,
            max_individual_file_size: 20 * 1024 * 1024,
            max_file_count: 500,
            disk_space_factor: 2,
        }
    }
}

/// Download coordination and transport knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Overall per-resource timeout in seconds.
    pub resource_timeout_secs: u64,
    /// Minimum interval between attempts for the same module, in seconds.
    pub cooldown_secs: u64,
    /// Maximum simultaneously active attempts.
    pub max_concurrent: usize,
    /// Maximum completed attempts per rolling hour.
    pub max_per_hour: usize,
    /// Bounded download-record history length.
    pub max_history: usize,
    /// Manifest endpoint URL.
    pub manifest_url: String,
    /// Base URL used to derive archive URLs when the manifest omits them;
    /// the archive for a module resolves to `<base>/<id>/<version>.zip`.
    pub download_base_url: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            resource_timeout_secs: 300,
            cooldown_secs: 5,
            max_concurrent: 3,
            max_per_hour: 20,
            max_history: 200,
            manifest_url: String::new(),
            download_base_url: String::new(),
        }
    }
}

/// Manifest freshness and signature policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    /// Maximum accepted manifest age in seconds (replay window).
    pub max_age_secs: i64,
    /// Maximum tolerated forward clock skew in seconds.
    pub max_future_skew_secs: i64,
    /// Minimum nonce length in characters.
    pub min_nonce_len: usize,
    /// Reject manifests published for a different environment.
    pub enforce_environment_match: bool,
    /// Verify the manifest RSA signature. Disabling this is a test-only
    /// escape hatch and never the default.
    pub verify_signatures: bool,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 300,
            max_future_skew_secs: 60,
            min_nonce_len: 16,
            enforce_environment_match: true,
            verify_signatures: true,
        }
    }
}

/// Archive extraction filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Allowed file extensions (lowercase, without the dot). Extensionless
    /// files are always allowed.
    pub allowed_extensions: Vec<String>,
    /// Substrings that reject an entry path outright.
    pub forbidden_patterns: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: [
                "html", "css", "js", "json", "png", "jpg", "jpeg", "svg", "woff", "woff2", "ttf",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            forbidden_patterns: ["..", "~", "__MACOSX", ".DS_Store", ".git", ".svn"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Certificate pinning policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PinningConfig {
    /// Base64-encoded SHA-256 digests of accepted leaf SPKIs.
    pub pins: Vec<String>,
    /// Accept default trust for `localhost`/`127.0.0.1` without pinning.
    /// Off by default; enable only in local development.
    pub allow_insecure_localhost: bool,
}

impl Default for PinningConfig {
    fn default() -> Self {
        Self {
            pins: Vec::new(),
            allow_insecure_localhost: false,
        }
    }
}
