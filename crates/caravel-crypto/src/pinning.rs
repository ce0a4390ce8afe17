//! Certificate pinning.
//!
//! The pinner decides TLS server-trust challenges: the leaf certificate's
//! SubjectPublicKeyInfo is hashed with SHA-256, base64-encoded, and compared
//! against the compiled-in pin set. Pinning the SPKI rather than the whole
//! certificate survives reissuance under the same key.

use std::collections::HashSet;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use x509_parser::prelude::*;

use crate::error::{CryptoError, CryptoResult};

/// Outcome of a pinning evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinningDecision {
    /// Localhost development bypass: defer to default system trust.
    UseSystemTrust,
    /// The leaf SPKI matched a pin; trust the presented chain.
    AcceptPinned {
        /// Base64 SHA-256 of the matched SPKI.
        spki_hash: String,
    },
    /// Cancel the challenge.
    Reject {
        /// Human-readable rejection reason (audit detail).
        reason: String,
    },
}

impl PinningDecision {
    /// Whether the challenge should proceed with the server's credential.
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        !matches!(self, Self::Reject { .. })
    }
}

/// Evaluates server certificate chains against a pinned SPKI set.
#[derive(Debug, Clone)]
pub struct CertificatePinner {
    pins: HashSet<String>,
    allow_insecure_localhost: bool,
}

impl CertificatePinner {
    /// Create a pinner from base64 SPKI SHA-256 pins.
    #[must_use]
    pub fn new(pins: impl IntoIterator<Item = String>, allow_insecure_localhost: bool) -> Self {
        Self {
            pins: pins.into_iter().collect(),
            allow_insecure_localhost,
        }
    }

    /// Decide a server-trust challenge for `host` presenting `leaf_der`.
    ///
    /// `leaf_der` is the DER encoding of the chain's leaf certificate, or
    /// `None` when the server presented no certificate.
    #[must_use]
    pub fn evaluate(&self, host: &str, leaf_der: Option<&[u8]>) -> PinningDecision {
        if self.allow_insecure_localhost && (host == "localhost" || host == "127.0.0.1") {
            debug!(host, "localhost pinning bypass active");
            return PinningDecision::UseSystemTrust;
        }

        let Some(der) = leaf_der else {
            warn!(host, "server presented no certificate");
            return PinningDecision::Reject {
                reason: "no server certificate presented".into(),
            };
        };

        let spki_hash = match spki_sha256_b64(der) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(host, error = %e, "could not extract server public key");
                return PinningDecision::Reject {
                    reason: format!("no extractable public key: {e}"),
                };
            }
        };

        if self.pins.contains(&spki_hash) {
            debug!(host, spki_hash = %spki_hash, "certificate pin matched");
            PinningDecision::AcceptPinned { spki_hash }
        } else {
            warn!(host, presented = %spki_hash, "certificate pin mismatch");
            PinningDecision::Reject {
                reason: format!("public key hash {spki_hash} not in pin set"),
            }
        }
    }
}

/// Base64 SHA-256 of the SubjectPublicKeyInfo of a DER certificate.
///
/// # Errors
///
/// Returns [`CryptoError::UnparsableCertificate`] if the bytes are not a
/// well-formed X.509 certificate.
pub fn spki_sha256_b64(cert_der: &[u8]) -> CryptoResult<String> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| CryptoError::UnparsableCertificate(e.to_string()))?;
    let spki = cert.public_key();
    Ok(BASE64.encode(Sha256::digest(spki.raw)))
}

#[cfg(test)]
mod tests {
    use rcgen::{CertificateParams, KeyPair};

    use super::*;

    fn self_signed_der(host: &str) -> Vec<u8> {
        let params = CertificateParams::new(vec![host.to_string()]).unwrap();
        let keypair = KeyPair::generate().unwrap();
        params.self_signed(&keypair).unwrap().der().to_vec()
    }

    #[test]
    fn matching_pin_accepts() {
        let der = self_signed_der("modules.example.test");
        let pin = spki_sha256_b64(&der).unwrap();

        let pinner = CertificatePinner::new([pin.clone()], false);
        let decision = pinner.evaluate("modules.example.test", Some(&der));
        assert_eq!(decision, PinningDecision::AcceptPinned { spki_hash: pin });
        assert!(decision.is_trusted());
    }

    #[test]
    fn unknown_key_rejects() {
        let pinned = spki_sha256_b64(&self_signed_der("modules.example.test")).unwrap();
        let other = self_signed_der("modules.example.test");

        let pinner = CertificatePinner::new([pinned], false);
        let decision = pinner.evaluate("modules.example.test", Some(&other));
        assert!(matches!(decision, PinningDecision::Reject { .. }));
        assert!(!decision.is_trusted());
    }

    #[test]
    fn missing_certificate_rejects() {
        let pinner = CertificatePinner::new([], false);
        assert!(matches!(
            pinner.evaluate("modules.example.test", None),
            PinningDecision::Reject { .. }
        ));
    }

    #[test]
    fn garbage_certificate_rejects() {
        let pinner = CertificatePinner::new([], false);
        assert!(matches!(
            pinner.evaluate("modules.example.test", Some(b"not a certificate")),
            PinningDecision::Reject { .. }
        ));
    }

    #[test]
    fn localhost_bypass_only_when_enabled() {
        let relaxed = CertificatePinner::new([], true);
        assert_eq!(
            relaxed.evaluate("localhost", None),
            PinningDecision::UseSystemTrust
        );
        assert_eq!(
            relaxed.evaluate("127.0.0.1", None),
            PinningDecision::UseSystemTrust
        );
        // The bypass never extends to other hosts.
        assert!(matches!(
            relaxed.evaluate("modules.example.test", None),
            PinningDecision::Reject { .. }
        ));

        let strict = CertificatePinner::new([], false);
        assert!(matches!(
            strict.evaluate("localhost", None),
            PinningDecision::Reject { .. }
        ));
    }
}
