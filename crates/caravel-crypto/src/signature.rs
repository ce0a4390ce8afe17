//! Manifest signature verification.
//!
//! Manifests are signed server-side with RSA-2048 PKCS#1 v1.5 over the
//! SHA-256 of the canonical body bytes. The public key ships as a
//! compile-time PEM (SPKI) constant; alternate keys can be supplied for
//! staging servers and tests via [`SignatureVerifier::from_pem`].

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{CryptoError, CryptoResult};

/// Production manifest signing key (SPKI PEM).
pub const BUILTIN_MANIFEST_PUBLIC_KEY_PEM: &str = "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEAtomnRcUOnGIEQFP4aFRH
dKIAvXAkfey6jdDB1KBeMOtpQFvNLYlRj3hV1Ayf+CkK+vxicvMDmMKm8NGentOE
3taoPpFBj4EptVMpbhjPWfxtqtcpPyKLrUuuKjv34jg4gc5OEywjly4I6Idj1d/8
oAzKEHRBnFp0o1qRBrozBN+1LPXo+j3zUPbOZUvnhau+SyhSJmKItXYKQ1V4TD4n
HkxAqFu9RZTqNYjCedOqvrdlQ6s1SYs5yFFFONGqIVnHBoJDS4Vjs/g6ppePH8VR
sWrFo+cLaGyYhFk8tTlk7OIPb4r2zAPp+tCHrszpeXPYhaJMATWfECd7v7YKHCw1
TwIDAQAB
-----END PUBLIC KEY-----";

/// Signature algorithm identifier, as recorded in audit events.
pub const SIGNATURE_ALGORITHM: &str = "RSA-2048/PKCS1v15/SHA-256";

/// Verifies RSA PKCS#1 v1.5 signatures over canonical manifest bodies.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    key: RsaPublicKey,
}

impl SignatureVerifier {
    /// Parse a verifier from an SPKI PEM string.
    ///
    /// The PEM armor is stripped and the base64 payload decoded by hand, so
    /// a key with a mangled header fails with a precise error instead of a
    /// generic parse failure.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MalformedPublicKey`] on any parse failure.
    pub fn from_pem(pem: &str) -> CryptoResult<Self> {
        let body: String = pem
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("-----"))
            .collect();

        if body.is_empty() {
            return Err(CryptoError::MalformedPublicKey(
                "no base64 payload between PEM markers".into(),
            ));
        }

        let der = BASE64
            .decode(body.as_bytes())
            .map_err(|e| CryptoError::MalformedPublicKey(format!("invalid base64: {e}")))?;

        let key = RsaPublicKey::from_public_key_der(&der)
            .map_err(|e| CryptoError::MalformedPublicKey(format!("invalid SPKI DER: {e}")))?;

        Ok(Self { key })
    }

    /// Verifier for the compiled-in production key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MalformedPublicKey`] if the embedded constant
    /// is corrupt (a build defect, not runtime input).
    pub fn builtin() -> CryptoResult<Self> {
        Self::from_pem(BUILTIN_MANIFEST_PUBLIC_KEY_PEM)
    }

    /// The algorithm identifier for audit events.
    #[must_use]
    pub fn algorithm(&self) -> &'static str {
        SIGNATURE_ALGORITHM
    }

    /// Verify a base64-encoded signature over the canonical body bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SignatureVerificationFailed`] on bad base64 or
    /// a signature that does not verify under the key.
    pub fn verify(&self, body: &[u8], signature_b64: &str) -> CryptoResult<()> {
        let signature = BASE64.decode(signature_b64.trim()).map_err(|e| {
            CryptoError::SignatureVerificationFailed(format!("invalid base64 signature: {e}"))
        })?;

        let digest = Sha256::digest(body);
        self.key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
            .map_err(|e| CryptoError::SignatureVerificationFailed(e.to_string()))?;

        debug!(algorithm = SIGNATURE_ALGORITHM, "manifest signature verified");
        Ok(())
    }
}
