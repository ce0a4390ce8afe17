//! Caravel Crypto - verification primitives for the module delivery pipeline.
//!
//! This crate provides:
//! - [`ChecksumEngine`]: SHA-256/SHA-512 digests with constant-time comparison
//! - [`SignatureVerifier`]: RSA-2048 PKCS#1 v1.5 verification of manifest bodies
//! - [`CertificatePinner`]: leaf-certificate SPKI pinning decisions

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod checksum;
mod error;
mod pinning;
mod signature;

pub use checksum::ChecksumEngine;
pub use error::{CryptoError, CryptoResult};
pub use pinning::{CertificatePinner, PinningDecision, spki_sha256_b64};
pub use signature::{BUILTIN_MANIFEST_PUBLIC_KEY_PEM, SIGNATURE_ALGORITHM, SignatureVerifier};
