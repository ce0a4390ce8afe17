use std::path::PathBuf;
use thiserror::Error;

/// Errors from core type construction and configuration loading.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The module ID is malformed.
    #[error("invalid module id '{0}': must be non-empty lowercase alphanumeric with hyphens")]
    InvalidModuleId(String),

    /// The environment string is not a known environment.
    #[error("unknown environment '{0}'")]
    UnknownEnvironment(String),

    /// Failed to read a configuration file.
    #[error("failed to read config at {path}: {source}")]
    ConfigIo {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse configuration TOML.
    #[error("failed to parse config: {0}")]
    ConfigParse(String),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
