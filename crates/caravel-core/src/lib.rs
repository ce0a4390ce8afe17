//! Caravel Core - shared types for the Caravel secure module delivery pipeline.
//!
//! This crate provides:
//! - Validated identifiers and module descriptors
//! - The on-disk install layout (modules, backups, quarantine, staging)
//! - Security configuration with production-safe defaults, loadable from TOML
//! - The clock abstraction used by freshness and rate-limit checks

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod clock;
mod config;
mod error;
mod layout;
mod types;

pub use clock::{Clock, SystemClock};
pub use config::{
    DownloadConfig, ExtractionConfig, LimitsConfig, ManifestConfig, PinningConfig, SecurityConfig,
};
pub use error::{CoreError, CoreResult};
pub use layout::InstallLayout;
pub use types::{ChecksumAlgorithm, Environment, ModuleDescriptor, ModuleId};
