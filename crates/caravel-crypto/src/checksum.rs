//! Archive checksum computation and verification.
//!
//! Digests are compared in constant time via the `subtle` crate so that a
//! mismatch cannot be probed through timing.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use caravel_core::ChecksumAlgorithm;

use crate::error::{CryptoError, CryptoResult};

/// Read buffer for streamed file hashing.
const HASH_BUF_SIZE: usize = 64 * 1024;

/// Computes and verifies SHA-2 digests over bytes and files.
#[derive(Debug, Clone, Copy)]
pub struct ChecksumEngine {
    algorithm: ChecksumAlgorithm,
}

impl ChecksumEngine {
    /// Create an engine for the given algorithm.
    #[must_use]
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        Self { algorithm }
    }

    /// The algorithm this engine computes.
    #[must_use]
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Hex digest of an in-memory byte slice.
    #[must_use]
    pub fn digest_bytes(&self, data: &[u8]) -> String {
        match self.algorithm {
            ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            ChecksumAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }

    /// Hex digest of a file, read in [`HASH_BUF_SIZE`] chunks.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Io`] if the file cannot be read.
    pub fn digest_file(&self, path: &Path) -> CryptoResult<(String, u64)> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; HASH_BUF_SIZE];
        let mut total: u64 = 0;

        match self.algorithm {
            ChecksumAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    total = total.saturating_add(n as u64);
                }
                Ok((hex::encode(hasher.finalize()), total))
            }
            ChecksumAlgorithm::Sha512 => {
                let mut hasher = Sha512::new();
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    total = total.saturating_add(n as u64);
                }
                Ok((hex::encode(hasher.finalize()), total))
            }
        }
    }

    /// Verify in-memory bytes against an expected hex digest.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MalformedDigest`] on an invalid expected digest
    /// and [`CryptoError::ChecksumMismatch`] when the digests differ.
    pub fn verify_bytes(&self, data: &[u8], expected_hex: &str) -> CryptoResult<()> {
        let actual = self.digest_bytes(data);
        self.compare(&actual, expected_hex)
    }

    /// Verify a file against an expected hex digest.
    ///
    /// Returns the number of bytes hashed on success.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Io`] on read failure,
    /// [`CryptoError::MalformedDigest`] on an invalid expected digest, and
    /// [`CryptoError::ChecksumMismatch`] when the digests differ.
    pub fn verify_file(&self, path: &Path, expected_hex: &str) -> CryptoResult<u64> {
        let (actual, size) = self.digest_file(path)?;
        self.compare(&actual, expected_hex)?;
        Ok(size)
    }

    fn compare(&self, actual_hex: &str, expected_hex: &str) -> CryptoResult<()> {
        let expected = hex::decode(expected_hex).map_err(|_| CryptoError::MalformedDigest {
            algorithm: self.algorithm,
            digest: expected_hex.to_string(),
        })?;
        if expected.len() != self.algorithm.digest_len() {
            return Err(CryptoError::MalformedDigest {
                algorithm: self.algorithm,
                digest: expected_hex.to_string(),
            });
        }

        // hex::decode cannot fail on our own output.
        let actual = hex::decode(actual_hex).unwrap_or_default();
        if bool::from(actual.ct_eq(&expected)) {
            Ok(())
        } else {
            Err(CryptoError::ChecksumMismatch {
                algorithm: self.algorithm,
                expected: expected_hex.to_string(),
                actual: actual_hex.to_string(),
            })
        }
    }
}
