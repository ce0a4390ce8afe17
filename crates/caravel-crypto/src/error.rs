use thiserror::Error;

use caravel_core::ChecksumAlgorithm;

/// Errors from cryptographic verification.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The embedded or supplied public key could not be parsed.
    #[error("malformed public key: {0}")]
    MalformedPublicKey(String),

    /// The manifest signature did not verify.
    #[error("signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    /// The expected digest string is not valid hex of the right length.
    #[error("malformed {algorithm} digest '{digest}'")]
    MalformedDigest {
        /// Algorithm the digest was supposed to be for.
        algorithm: ChecksumAlgorithm,
        /// The offending digest string.
        digest: String,
    },

    /// Computed digest does not match the expected one.
    #[error("{algorithm} checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Algorithm used.
        algorithm: ChecksumAlgorithm,
        /// Expected hex digest.
        expected: String,
        /// Actual hex digest.
        actual: String,
    },

    /// A certificate could not be parsed as DER X.509.
    #[error("unparsable certificate: {0}")]
    UnparsableCertificate(String),

    /// I/O error while hashing a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
