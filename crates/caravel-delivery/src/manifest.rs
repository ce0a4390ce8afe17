//! Signed manifest parsing and validation.
//!
//! The manifest endpoint returns an envelope whose `manifest` object carries
//! the module list, a timestamp, a nonce, an environment, and an RSA
//! signature. The signature covers the *canonical body*: the manifest object
//! minus `signature`, serialized with sorted keys. `serde_json`'s default
//! object map is ordered, so reserializing the parsed value reproduces the
//! server's signing bytes — provided the `preserve_order` feature stays off.
//!
//! Validation order: timestamp freshness, nonce length, signature,
//! environment. A manifest that fails freshness is rejected before any
//! cryptographic work happens.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use caravel_audit::{AuditEvent, AuditSink};
use caravel_core::{Environment, ModuleDescriptor, ModuleId, SecurityConfig};
use caravel_crypto::SignatureVerifier;

use crate::error::ManifestError;

/// Envelope returned by the manifest endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEnvelope {
    /// The signed manifest object (kept raw for canonicalization).
    pub manifest: Value,
    /// Server wall-clock time, informational.
    #[serde(default)]
    pub server_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireManifest {
    modules: Vec<WireModule>,
    timestamp: String,
    nonce: String,
    environment: String,
    #[serde(default)]
    signature: String,
}

#[derive(Debug, Deserialize)]
struct WireModule {
    id: ModuleId,
    name: String,
    version: String,
    checksum: String,
    size: u64,
    environment: String,
    #[serde(default)]
    url: Option<String>,
}

/// A manifest that passed every validation gate.
#[derive(Debug, Clone)]
pub struct ValidatedManifest {
    /// Server-confirmed module descriptors.
    pub modules: Vec<ModuleDescriptor>,
    /// Parsed manifest timestamp.
    pub timestamp: DateTime<Utc>,
    /// Manifest nonce.
    pub nonce: String,
    /// Environment the manifest was published for.
    pub environment: Environment,
}

/// Validates signed manifests against freshness, nonce, signature, and
/// environment policy.
#[derive(Debug)]
pub struct ManifestValidator {
    verifier: SignatureVerifier,
    max_age: Duration,
    max_future_skew: Duration,
    min_nonce_len: usize,
    enforce_environment_match: bool,
    verify_signatures: bool,
    environment: Environment,
    download_base_url: String,
    audit: AuditSink,
}

impl ManifestValidator {
    /// Build a validator from configuration.
    #[must_use]
    pub fn new(config: &SecurityConfig, verifier: SignatureVerifier, audit: AuditSink) -> Self {
        Self {
            verifier,
            max_age: Duration::seconds(config.manifest.max_age_secs),
            max_future_skew: Duration::seconds(config.manifest.max_future_skew_secs),
            min_nonce_len: config.manifest.min_nonce_len,
            enforce_environment_match: config.manifest.enforce_environment_match,
            verify_signatures: config.manifest.verify_signatures,
            environment: config.environment,
            download_base_url: config.downloads.download_base_url.clone(),
            audit,
        }
    }

    /// Validate a manifest envelope against `now`.
    ///
    /// # Errors
    ///
    /// Returns a [`ManifestError`] naming the first gate that rejected the
    /// manifest.
    pub fn validate(
        &self,
        envelope: &ManifestEnvelope,
        now: DateTime<Utc>,
    ) -> Result<ValidatedManifest, ManifestError> {
        let wire: WireManifest = serde_json::from_value(envelope.manifest.clone())
            .map_err(|e| ManifestError::Malformed(e.to_string()))?;

        let timestamp = DateTime::parse_from_rfc3339(&wire.timestamp)
            .map_err(|_| ManifestError::InvalidTimestamp(wire.timestamp.clone()))?
            .with_timezone(&Utc);

        let age = now.signed_duration_since(timestamp);
        if age < -self.max_future_skew {
            let skew_secs = (-age).num_seconds();
            warn!(skew_secs, "manifest timestamp ahead of local clock");
            self.audit
                .emit(AuditEvent::ManifestTimestampInFuture { skew_secs });
            return Err(ManifestError::TimestampInFuture { skew_secs });
        }
        if age >= self.max_age {
            let age_secs = age.num_seconds();
            warn!(age_secs, "stale manifest rejected");
            self.audit
                .emit(AuditEvent::ReplayAttemptDetected { age_secs });
            return Err(ManifestError::TooOld { age_secs });
        }

        let nonce_len = wire.nonce.chars().count();
        if nonce_len < self.min_nonce_len {
            return Err(ManifestError::InvalidNonce { length: nonce_len });
        }

        if self.verify_signatures {
            let body = canonical_body_bytes(&envelope.manifest)?;
            if let Err(e) = self.verifier.verify(&body, &wire.signature) {
                let detail = e.to_string();
                self.audit.emit(AuditEvent::SignatureVerificationFailed {
                    detail: detail.clone(),
                });
                self.audit.emit(AuditEvent::InvalidSignatureDetected {
                    detail: detail.clone(),
                });
                return Err(ManifestError::InvalidSignature(detail));
            }
            self.audit.emit(AuditEvent::SignatureVerified {
                algorithm: self.verifier.algorithm().to_string(),
            });
        }

        let environment: Environment = wire
            .environment
            .parse()
            .map_err(|_| ManifestError::Malformed(format!(
                "unknown manifest environment '{}'",
                wire.environment
            )))?;
        if self.enforce_environment_match && environment != self.environment {
            return Err(ManifestError::EnvironmentMismatch {
                expected: self.environment,
                actual: wire.environment,
            });
        }

        let modules = wire
            .modules
            .into_iter()
            .map(|m| self.descriptor(m))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            modules = modules.len(),
            nonce = %wire.nonce,
            "manifest validated"
        );

        Ok(ValidatedManifest {
            modules,
            timestamp,
            nonce: wire.nonce,
            environment,
        })
    }

    fn descriptor(&self, module: WireModule) -> Result<ModuleDescriptor, ManifestError> {
        let environment: Environment = module.environment.parse().map_err(|_| {
            ManifestError::Malformed(format!(
                "unknown environment '{}' for module '{}'",
                module.environment, module.id
            ))
        })?;

        let download_url = module.url.unwrap_or_else(|| {
            format!(
                "{}/{}/{}.zip",
                self.download_base_url.trim_end_matches('/'),
                module.id,
                module.version
            )
        });

        Ok(ModuleDescriptor {
            id: module.id,
            name: module.name,
            version: module.version,
            checksum_hex: module.checksum,
            size_bytes: module.size,
            environment,
            download_url,
        })
    }
}

/// Canonical signing bytes of a manifest object: the object minus
/// `signature`, serialized with sorted keys.
///
/// # Errors
///
/// Returns [`ManifestError::Malformed`] when the manifest is not a JSON
/// object.
pub fn canonical_body_bytes(manifest: &Value) -> Result<Vec<u8>, ManifestError> {
    let Value::Object(object) = manifest else {
        return Err(ManifestError::Malformed(
            "manifest is not a JSON object".into(),
        ));
    };
    let mut body = object.clone();
    body.remove("signature");
    serde_json::to_vec(&Value::Object(body)).map_err(|e| ManifestError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use chrono::SecondsFormat;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::{Pkcs1v15Sign, RsaPrivateKey};
    use sha2::{Digest, Sha256};

    use caravel_audit::MemoryHandle;

    use super::*;

    fn test_key() -> (RsaPrivateKey, SignatureVerifier) {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = key
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        (key, SignatureVerifier::from_pem(&pem).unwrap())
    }

    fn signed_envelope(key: &RsaPrivateKey, timestamp: &str, nonce: &str) -> ManifestEnvelope {
        let mut manifest = serde_json::json!({
            "modules": [{
                "id": "feature-dashboard",
                "name": "Dashboard Module",
                "version": "1.0.0",
                "checksum": "ab".repeat(32),
                "size": 1024,
                "environment": "development",
            }],
            "timestamp": timestamp,
            "nonce": nonce,
            "environment": "development",
        });

        let body = canonical_body_bytes(&manifest).unwrap();
        let digest = Sha256::digest(&body);
        let signature = key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap();
        manifest["signature"] = Value::String(BASE64.encode(signature));

        ManifestEnvelope {
            manifest,
            server_time: None,
        }
    }

    fn validator(verifier: SignatureVerifier) -> (ManifestValidator, AuditSink, MemoryHandle) {
        let mut config = SecurityConfig::default();
        config.environment = Environment::Development;
        config.downloads.download_base_url = "https://modules.example.test/archives".into();
        let (audit, handle) = AuditSink::memory();
        (
            ManifestValidator::new(&config, verifier, audit.clone()),
            audit,
            handle,
        )
    }

    fn ts(now: DateTime<Utc>, offset_secs: i64) -> String {
        (now + Duration::seconds(offset_secs)).to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    #[tokio::test]
    async fn accepts_fresh_signed_manifest() {
        let (key, verifier) = test_key();
        let (validator, _sink, _audit) = validator(verifier);
        let now = Utc::now();

        let envelope = signed_envelope(&key, &ts(now, 0), "0123456789abcdef");
        let validated = validator.validate(&envelope, now).unwrap();

        assert_eq!(validated.modules.len(), 1);
        let module = &validated.modules[0];
        assert_eq!(module.id.as_str(), "feature-dashboard");
        assert_eq!(module.size_bytes, 1024);
        assert_eq!(module.environment, Environment::Development);
        assert_eq!(
            module.download_url,
            "https://modules.example.test/archives/feature-dashboard/1.0.0.zip"
        );
    }

    #[tokio::test]
    async fn accepts_whole_second_timestamps() {
        let (key, verifier) = test_key();
        let (validator, _sink, _audit) = validator(verifier);
        let now = Utc::now();

        let timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        let envelope = signed_envelope(&key, &timestamp, "0123456789abcdef");
        validator.validate(&envelope, now).unwrap();
    }

    #[tokio::test]
    async fn rejects_stale_manifest_with_replay_event() {
        let (key, verifier) = test_key();
        let (validator, sink, audit) = validator(verifier);
        let now = Utc::now();

        let envelope = signed_envelope(&key, &ts(now, -600), "0123456789abcdef");
        let err = validator.validate(&envelope, now).unwrap_err();
        assert!(matches!(err, ManifestError::TooOld { age_secs } if age_secs >= 599));

        sink.flush().await;
        assert!(audit.contains_kind("replay_attempt_detected"));
    }

    #[tokio::test]
    async fn age_boundaries_are_strict() {
        let (key, verifier) = test_key();
        let (validator, _sink, _audit) = validator(verifier);
        let now = Utc::now();

        // Exactly max_age is rejected (strict <).
        let envelope = signed_envelope(&key, &ts(now, -300), "0123456789abcdef");
        assert!(matches!(
            validator.validate(&envelope, now).unwrap_err(),
            ManifestError::TooOld { .. }
        ));

        // One second inside the window is accepted.
        let envelope = signed_envelope(&key, &ts(now, -299), "0123456789abcdef");
        validator.validate(&envelope, now).unwrap();

        // -60s skew is tolerated, -61s is not.
        let envelope = signed_envelope(&key, &ts(now, 60), "0123456789abcdef");
        validator.validate(&envelope, now).unwrap();

        let envelope = signed_envelope(&key, &ts(now, 61), "0123456789abcdef");
        assert!(matches!(
            validator.validate(&envelope, now).unwrap_err(),
            ManifestError::TimestampInFuture { .. }
        ));
    }

    #[tokio::test]
    async fn nonce_length_boundary() {
        let (key, verifier) = test_key();
        let (validator, _sink, _audit) = validator(verifier);
        let now = Utc::now();

        let envelope = signed_envelope(&key, &ts(now, 0), "0123456789abcde");
        assert!(matches!(
            validator.validate(&envelope, now).unwrap_err(),
            ManifestError::InvalidNonce { length: 15 }
        ));

        let envelope = signed_envelope(&key, &ts(now, 0), "0123456789abcdef");
        validator.validate(&envelope, now).unwrap();
    }

    #[tokio::test]
    async fn rejects_tampered_manifest() {
        let (key, verifier) = test_key();
        let (validator, _sink, _audit) = validator(verifier);
        let now = Utc::now();

        let mut envelope = signed_envelope(&key, &ts(now, 0), "0123456789abcdef");
        envelope.manifest["modules"][0]["checksum"] = Value::String("00".repeat(32));

        let err = validator.validate(&envelope, now).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidSignature(_)));
    }

    #[tokio::test]
    async fn rejects_unsigned_manifest() {
        let (key, verifier) = test_key();
        let (validator, _sink, _audit) = validator(verifier);
        let now = Utc::now();

        let mut envelope = signed_envelope(&key, &ts(now, 0), "0123456789abcdef");
        envelope
            .manifest
            .as_object_mut()
            .unwrap()
            .remove("signature");

        assert!(matches!(
            validator.validate(&envelope, now).unwrap_err(),
            ManifestError::InvalidSignature(_)
        ));
    }

    #[tokio::test]
    async fn rejects_environment_mismatch() {
        let (key, verifier) = test_key();
        let mut config = SecurityConfig::default();
        config.environment = Environment::Production;
        let (audit, _) = AuditSink::memory();
        let validator = ManifestValidator::new(&config, verifier, audit);
        let now = Utc::now();

        let envelope = signed_envelope(&key, &ts(now, 0), "0123456789abcdef");
        let err = validator.validate(&envelope, now).unwrap_err();
        assert!(matches!(
            err,
            ManifestError::EnvironmentMismatch {
                expected: Environment::Production,
                ..
            }
        ));
    }

    #[test]
    fn canonical_bytes_sort_keys_and_drop_signature() {
        // Field order in the source text must not matter.
        let a: Value = serde_json::from_str(
            r#"{"timestamp":"2026-01-01T00:00:00Z","nonce":"n","signature":"sig","environment":"development","modules":[]}"#,
        )
        .unwrap();
        let b: Value = serde_json::from_str(
            r#"{"modules":[],"environment":"development","nonce":"n","timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let bytes_a = canonical_body_bytes(&a).unwrap();
        let bytes_b = canonical_body_bytes(&b).unwrap();
        assert_eq!(bytes_a, bytes_b);

        let text = String::from_utf8(bytes_a).unwrap();
        assert!(!text.contains("signature"));
        // Sorted key order.
        let env_pos = text.find("environment").unwrap();
        let modules_pos = text.find("modules").unwrap();
        let nonce_pos = text.find("nonce").unwrap();
        let ts_pos = text.find("timestamp").unwrap();
        assert!(env_pos < modules_pos && modules_pos < nonce_pos && nonce_pos < ts_pos);
    }

    #[test]
    fn canonical_bytes_reject_non_objects() {
        assert!(canonical_body_bytes(&Value::Null).is_err());
        assert!(canonical_body_bytes(&Value::String("x".into())).is_err());
    }
}
