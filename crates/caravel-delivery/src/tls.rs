//! Certificate pinning enforcement for TLS handshakes.
//!
//! Wraps the webpki chain verifier with the pin check so that every HTTPS
//! handshake the transport performs consults the pinned SPKI set. A pin
//! match is itself the trust anchor (the chain need not terminate at a
//! public root); the localhost bypass defers to standard verification; any
//! other outcome cancels the handshake.

use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tracing::warn;

use caravel_audit::{AuditEvent, AuditSink};
use caravel_crypto::{CertificatePinner, PinningDecision};

use crate::error::NetworkError;

/// Build a rustls client config that enforces `pinner` on every handshake.
pub(crate) fn pinned_tls_config(
    pinner: CertificatePinner,
    audit: AuditSink,
) -> Result<rustls::ClientConfig, NetworkError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| NetworkError::Http(format!("failed to build TLS verifier: {e}")))?;

    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| NetworkError::Http(format!("failed to configure TLS: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier {
            pinner,
            webpki,
            audit,
        }))
        .with_no_client_auth();
    Ok(config)
}

/// Server-trust verifier that decides challenges through the pinner.
#[derive(Debug)]
pub(crate) struct PinnedServerVerifier {
    pinner: CertificatePinner,
    webpki: Arc<WebPkiServerVerifier>,
    audit: AuditSink,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let host = server_name.to_str();
        match self.pinner.evaluate(&host, Some(end_entity.as_ref())) {
            PinningDecision::UseSystemTrust => self.webpki.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ),
            PinningDecision::AcceptPinned { spki_hash } => {
                self.audit
                    .emit(AuditEvent::CertificatePinningSuccess { spki_hash });
                Ok(ServerCertVerified::assertion())
            }
            PinningDecision::Reject { reason } => {
                warn!(host = %host, reason = %reason, "TLS challenge cancelled");
                self.audit.emit(AuditEvent::CertificatePinningFailed {
                    host: host.into_owned(),
                    reason: reason.clone(),
                });
                Err(rustls::Error::General(reason))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use caravel_crypto::spki_sha256_b64;
    use rcgen::{CertificateParams, KeyPair};

    use super::*;

    fn cert_der(host: &str) -> Vec<u8> {
        let params = CertificateParams::new(vec![host.to_string()]).unwrap();
        let keypair = KeyPair::generate().unwrap();
        params.self_signed(&keypair).unwrap().der().to_vec()
    }

    fn verifier(
        pins: Vec<String>,
    ) -> (PinnedServerVerifier, AuditSink, caravel_audit::MemoryHandle) {
        let (audit, handle) = AuditSink::memory();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .unwrap();
        (
            PinnedServerVerifier {
                pinner: CertificatePinner::new(pins, false),
                webpki,
                audit: audit.clone(),
            },
            audit,
            handle,
        )
    }

    #[tokio::test]
    async fn pinned_leaf_is_accepted() {
        let der = cert_der("modules.example.test");
        let pin = spki_sha256_b64(&der).unwrap();
        let (verifier, audit, handle) = verifier(vec![pin]);

        let server = ServerName::try_from("modules.example.test").unwrap();
        verifier
            .verify_server_cert(
                &CertificateDer::from(der),
                &[],
                &server,
                &[],
                UnixTime::now(),
            )
            .unwrap();

        audit.flush().await;
        assert!(handle.contains_kind("certificate_pinning_success"));
    }

    #[tokio::test]
    async fn unpinned_leaf_cancels_the_handshake() {
        let der = cert_der("modules.example.test");
        let (verifier, audit, handle) = verifier(Vec::new());

        let server = ServerName::try_from("modules.example.test").unwrap();
        let err = verifier
            .verify_server_cert(
                &CertificateDer::from(der),
                &[],
                &server,
                &[],
                UnixTime::now(),
            )
            .unwrap_err();
        assert!(matches!(err, rustls::Error::General(_)));

        audit.flush().await;
        assert!(handle.contains_kind("certificate_pinning_failed"));
    }

    #[tokio::test]
    async fn garbage_leaf_cancels_the_handshake() {
        let (verifier, _, _) = verifier(Vec::new());

        let server = ServerName::try_from("modules.example.test").unwrap();
        let err = verifier
            .verify_server_cert(
                &CertificateDer::from(b"not a certificate".to_vec()),
                &[],
                &server,
                &[],
                UnixTime::now(),
            )
            .unwrap_err();
        assert!(matches!(err, rustls::Error::General(_)));
    }
}
