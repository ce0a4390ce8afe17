//! Shared fixtures for pipeline integration tests.

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zip::write::SimpleFileOptions;

use caravel_audit::{AuditSink, MemoryHandle};
use caravel_core::{Clock, Environment, InstallLayout, SecurityConfig};
use caravel_crypto::SignatureVerifier;
use caravel_delivery::manifest::{ManifestEnvelope, canonical_body_bytes};
use caravel_delivery::orchestrator::StageEvent;
use caravel_delivery::pipeline::{DeliveryPipeline, DeliveryPipelineBuilder};
use caravel_delivery::transport::{
    DownloadProgress, DownloadedArchive, ModuleTransport, NetworkStatus,
};
use caravel_delivery::error::NetworkError;

/// One RSA keypair per test binary; 2048-bit generation is too slow to repeat.
pub fn signing_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("keygen"))
}

pub fn verifier() -> SignatureVerifier {
    let pem = signing_key()
        .to_public_key()
        .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .expect("pem");
    SignatureVerifier::from_pem(&pem).expect("verifier")
}

/// Deterministic clock pinned to a fixed instant.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Build an in-memory ZIP archive from `(entry_name, bytes)` pairs.
pub fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for &(name, data) in entries {
        writer
            .start_file(name, SimpleFileOptions::default())
            .expect("start_file");
        writer.write_all(data).expect("write entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// The instant every harness clock is pinned to.
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap()
}

/// A module entry for the wire manifest.
pub fn module_entry(id: &str, name: &str, version: &str, archive: &[u8], url: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "version": version,
        "checksum": sha256_hex(archive),
        "size": archive.len(),
        "environment": "development",
        "url": url,
    })
}

/// Sign a manifest body with the shared test key.
pub fn signed_envelope(modules: Vec<Value>, timestamp: DateTime<Utc>) -> ManifestEnvelope {
    let mut manifest = json!({
        "modules": modules,
        "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        "nonce": "0123456789abcdef",
        "environment": "development",
    });

    let body = canonical_body_bytes(&manifest).expect("canonical body");
    let digest = Sha256::digest(&body);
    let signature = signing_key()
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .expect("sign");
    manifest["signature"] = Value::String(BASE64.encode(signature));

    ManifestEnvelope {
        manifest,
        server_time: None,
    }
}

/// In-memory transport serving a manifest and archive set. Both sides are
/// mutable so a test can re-point the "server" between attempts.
pub struct FakeTransport {
    envelope: Mutex<ManifestEnvelope>,
    archives: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeTransport {
    pub fn new(envelope: ManifestEnvelope) -> Self {
        Self {
            envelope: Mutex::new(envelope),
            archives: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_archive(self, url: &str, bytes: Vec<u8>) -> Self {
        self.set_archive(url, bytes);
        self
    }

    pub fn set_archive(&self, url: &str, bytes: Vec<u8>) {
        self.archives.lock().unwrap().insert(url.to_string(), bytes);
    }

    pub fn set_envelope(&self, envelope: ManifestEnvelope) {
        *self.envelope.lock().unwrap() = envelope;
    }
}

#[async_trait]
impl ModuleTransport for FakeTransport {
    async fn fetch_manifest(&self) -> Result<ManifestEnvelope, NetworkError> {
        Ok(self.envelope.lock().unwrap().clone())
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<mpsc::UnboundedSender<DownloadProgress>>,
        cancel: &CancellationToken,
    ) -> Result<DownloadedArchive, NetworkError> {
        if cancel.is_cancelled() {
            return Err(NetworkError::Cancelled);
        }
        let bytes = self
            .archives
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(NetworkError::ServerError { status: 404 })?;
        tokio::fs::write(dest, &bytes).await?;
        let len = bytes.len() as u64;
        if let Some(tx) = progress {
            let _ = tx.send(DownloadProgress {
                bytes_received: len,
                expected_bytes: Some(len),
            });
        }
        Ok(DownloadedArchive {
            bytes_written: len,
            expected_bytes: Some(len),
        })
    }
}

/// A fully wired pipeline over temp directories and fakes.
pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub layout: InstallLayout,
    pub pipeline: DeliveryPipeline,
    pub transport: std::sync::Arc<FakeTransport>,
    pub clock: std::sync::Arc<ManualClock>,
    pub audit: AuditSink,
    pub events: MemoryHandle,
    pub stages: mpsc::UnboundedReceiver<StageEvent>,
}

impl Harness {
    pub fn build(transport: FakeTransport) -> Self {
        Self::build_with_config(transport, test_config())
    }

    pub fn build_with_config(transport: FakeTransport, config: SecurityConfig) -> Self {
        // Surface pipeline logs under `RUST_LOG`; repeated init is fine.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let tmp = tempfile::tempdir().expect("tempdir");
        let layout = InstallLayout::new(tmp.path().join("docs"), tmp.path().join("tmp"));
        let (audit, events) = AuditSink::memory();
        let (stage_tx, stages) = mpsc::unbounded_channel();
        let transport = std::sync::Arc::new(transport);
        let clock = std::sync::Arc::new(ManualClock::new());

        let pipeline = DeliveryPipelineBuilder::new(config, layout.clone())
            .with_transport(transport.clone())
            .with_clock(clock.clone())
            .with_verifier(verifier())
            .with_audit(audit.clone())
            .with_stage_events(stage_tx)
            .build()
            .expect("pipeline");

        Self {
            tmp,
            layout,
            pipeline,
            transport,
            clock,
            audit,
            events,
            stages,
        }
    }

    /// Drain every stage event published so far.
    pub fn stage_trace(&mut self) -> Vec<caravel_delivery::orchestrator::DownloadStage> {
        let mut trace = Vec::new();
        while let Ok(event) = self.stages.try_recv() {
            trace.push(event.stage);
        }
        trace
    }
}

pub fn test_config() -> SecurityConfig {
    let mut config = SecurityConfig::default();
    config.environment = Environment::Development;
    config.downloads.download_base_url = "https://modules.example.test/archives".into();
    config.downloads.manifest_url = "https://modules.example.test/manifest".into();
    config
}

pub fn network_online() -> NetworkStatus {
    NetworkStatus::Online
}
