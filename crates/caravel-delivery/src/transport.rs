//! Transport abstraction and HTTP implementation.
//!
//! The orchestrator is polymorphic over [`ModuleTransport`]; tests inject
//! in-memory fakes. [`HttpTransport`] enforces certificate pinning on every
//! handshake, follows redirects manually so that each hop is validated
//! against the original origin before it is fetched, and streams archive
//! bodies straight to the per-attempt temp file with a running byte cap, so
//! a lying `Content-Length` cannot fill the disk.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use caravel_audit::AuditSink;
use caravel_core::SecurityConfig;
use caravel_crypto::CertificatePinner;

use crate::error::NetworkError;
use crate::manifest::ManifestEnvelope;
use crate::tls::pinned_tls_config;

/// Maximum redirect hops followed for one request. Automatic redirects are
/// disabled on the client; every hop below is validated before following.
const MAX_REDIRECTS: u32 = 10;

/// Typed connectivity status, supplied by an external monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// Unmetered connectivity.
    Online,
    /// Metered or otherwise constrained connectivity.
    Constrained,
    /// No connectivity.
    Offline,
}

/// A progress sample during a download.
#[derive(Debug, Clone, Copy)]
pub struct DownloadProgress {
    /// Bytes received so far.
    pub bytes_received: u64,
    /// Expected total, when the server declared one.
    pub expected_bytes: Option<u64>,
}

/// Outcome of a completed download.
#[derive(Debug, Clone, Copy)]
pub struct DownloadedArchive {
    /// Bytes written to the destination file.
    pub bytes_written: u64,
    /// Expected total from `Content-Length`, when present.
    pub expected_bytes: Option<u64>,
}

/// Capability trait over the remote module source.
#[async_trait]
pub trait ModuleTransport: Send + Sync {
    /// Fetch the signed manifest envelope.
    async fn fetch_manifest(&self) -> Result<ManifestEnvelope, NetworkError>;

    /// Download `url` into `dest`, reporting progress and honouring
    /// cancellation. Partial files are removed on failure.
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<mpsc::UnboundedSender<DownloadProgress>>,
        cancel: &CancellationToken,
    ) -> Result<DownloadedArchive, NetworkError>;
}

/// HTTP transport over `reqwest` with pinned TLS.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    manifest_url: String,
    max_archive_bytes: u64,
    resource_timeout: Duration,
}

impl HttpTransport {
    /// Build a transport from configuration.
    ///
    /// Every HTTPS handshake is decided by `pinner` (see [`crate::tls`]);
    /// automatic redirects are off and hops are validated per request.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Http`] if the TLS config or HTTP client
    /// cannot be built.
    pub fn new(
        config: &SecurityConfig,
        pinner: CertificatePinner,
        audit: AuditSink,
    ) -> Result<Self, NetworkError> {
        let tls = pinned_tls_config(pinner, audit)?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(Duration::from_secs(config.downloads.request_timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("caravel/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NetworkError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            manifest_url: config.downloads.manifest_url.clone(),
            max_archive_bytes: config.limits.max_download_size,
            resource_timeout: Duration::from_secs(config.downloads.resource_timeout_secs),
        })
    }
}

fn classify(e: &reqwest::Error) -> NetworkError {
    if e.is_timeout() {
        NetworkError::Timeout
    } else if e.is_connect() {
        NetworkError::Offline
    } else {
        NetworkError::Http(e.to_string())
    }
}

/// Require `next` to share scheme, host, and port with `origin`.
///
/// A redirect that leaves the original origin could point the request at an
/// internal host, so it cancels the request instead of being followed.
fn validate_same_origin(origin: &url::Url, next: &url::Url) -> Result<(), NetworkError> {
    if next.scheme() != origin.scheme()
        || next.host_str() != origin.host_str()
        || next.port_or_known_default() != origin.port_or_known_default()
    {
        return Err(NetworkError::RedirectBlocked {
            url: next.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl ModuleTransport for HttpTransport {
    async fn fetch_manifest(&self) -> Result<ManifestEnvelope, NetworkError> {
        let url = url::Url::parse(&self.manifest_url)
            .map_err(|e| NetworkError::BadUrl(format!("{}: {e}", self.manifest_url)))?;
        debug!(%url, "fetching manifest");

        let response = self.send_following_redirects(url, "manifest", None).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::ServerError {
                status: status.as_u16(),
            });
        }

        response
            .json::<ManifestEnvelope>()
            .await
            .map_err(|e| NetworkError::Http(format!("undecodable manifest response: {e}")))
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<mpsc::UnboundedSender<DownloadProgress>>,
        cancel: &CancellationToken,
    ) -> Result<DownloadedArchive, NetworkError> {
        let url = url::Url::parse(url).map_err(|e| NetworkError::BadUrl(format!("{url}: {e}")))?;
        debug!(%url, dest = %dest.display(), "downloading archive");

        let result = tokio::time::timeout(
            self.resource_timeout,
            self.stream_to_file(url, dest, progress, cancel),
        )
        .await;

        match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => {
                let _ = tokio::fs::remove_file(dest).await;
                Err(e)
            }
            Err(_) => {
                warn!(dest = %dest.display(), "resource timeout elapsed");
                let _ = tokio::fs::remove_file(dest).await;
                Err(NetworkError::Timeout)
            }
        }
    }
}

impl HttpTransport {
    /// Follow redirects manually, validating each hop against the origin of
    /// the original request before fetching it.
    async fn send_following_redirects(
        &self,
        url: url::Url,
        context: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<reqwest::Response, NetworkError> {
        let origin = url.clone();
        let mut current = url;

        for _ in 0..MAX_REDIRECTS {
            let request = self.client.get(current.clone());
            let response = match cancel {
                Some(token) => tokio::select! {
                    () = token.cancelled() => return Err(NetworkError::Cancelled),
                    response = request.send() => response.map_err(|e| classify(&e))?,
                },
                None => request.send().await.map_err(|e| classify(&e))?,
            };

            if !response.status().is_redirection() {
                return Ok(response);
            }

            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    NetworkError::Http(format!("redirect without Location header for {context}"))
                })?;
            let next = current
                .join(location)
                .map_err(|e| NetworkError::BadUrl(format!("{location}: {e}")))?;
            validate_same_origin(&origin, &next)?;
            debug!(redirect = %next, context, "following validated redirect");
            current = next;
        }

        Err(NetworkError::Http(format!(
            "too many redirects for {context}"
        )))
    }

    async fn stream_to_file(
        &self,
        url: url::Url,
        dest: &Path,
        progress: Option<mpsc::UnboundedSender<DownloadProgress>>,
        cancel: &CancellationToken,
    ) -> Result<DownloadedArchive, NetworkError> {
        let response = self
            .send_following_redirects(url, "archive", Some(cancel))
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::ServerError {
                status: status.as_u16(),
            });
        }

        let expected_bytes = response.content_length();
        if let Some(expected) = expected_bytes
            && expected > self.max_archive_bytes
        {
            return Err(NetworkError::ResponseTooLarge {
                received: expected,
                limit: self.max_archive_bytes,
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => {
                    drop(file);
                    let _ = tokio::fs::remove_file(dest).await;
                    return Err(NetworkError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| classify(&e))?;

            received = received.saturating_add(chunk.len() as u64);
            if received > self.max_archive_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(NetworkError::ResponseTooLarge {
                    received,
                    limit: self.max_archive_bytes,
                });
            }

            file.write_all(&chunk).await?;
            if let Some(tx) = &progress {
                let _ = tx.send(DownloadProgress {
                    bytes_received: received,
                    expected_bytes,
                });
            }
        }

        file.flush().await?;
        debug!(bytes = received, "archive downloaded");
        Ok(DownloadedArchive {
            bytes_written: received,
            expected_bytes,
        })
    }
}
