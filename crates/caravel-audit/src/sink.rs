//! Non-blocking audit event delivery.
//!
//! [`AuditSink`] is a cheap-clone handle over an unbounded channel. A
//! dedicated worker task drains the channel into an [`AuditBackend`], so
//! `emit` never blocks the pipeline and events are not dropped under
//! backpressure. Events from one emitter arrive at the backend in emit order.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::event::{AuditEvent, AuditRecord, Severity};

/// Destination for audit records.
pub trait AuditBackend: Send + 'static {
    /// Record one event. Called from the sink's worker task.
    fn record(&mut self, record: &AuditRecord);
}

enum SinkMessage {
    Record(AuditRecord),
    Flush(oneshot::Sender<()>),
}

/// Handle for emitting audit events.
#[derive(Debug, Clone)]
pub struct AuditSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl AuditSink {
    /// Spawn a sink draining into `backend`.
    ///
    /// Must be called from within a tokio runtime. The worker exits when the
    /// last sink clone is dropped.
    #[must_use]
    pub fn new(mut backend: Box<dyn AuditBackend>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    SinkMessage::Record(record) => backend.record(&record),
                    SinkMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Sink that forwards events to `tracing`.
    #[must_use]
    pub fn tracing() -> Self {
        Self::new(Box::new(TracingBackend))
    }

    /// In-memory sink for tests; the returned handle snapshots captured
    /// records.
    #[must_use]
    pub fn memory() -> (Self, MemoryHandle) {
        let handle = MemoryHandle::default();
        let sink = Self::new(Box::new(MemoryBackend {
            records: Arc::clone(&handle.records),
        }));
        (sink, handle)
    }

    /// Emit an event. Never blocks; ordering is preserved per emitter.
    pub fn emit(&self, event: AuditEvent) {
        let record = AuditRecord {
            at: Utc::now(),
            severity: event.severity(),
            event,
        };
        // Send only fails when the worker is gone (runtime shutdown); the
        // event has nowhere to go at that point.
        let _ = self.tx.send(SinkMessage::Record(record));
    }

    /// Wait until every previously emitted event has reached the backend.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(SinkMessage::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Backend that forwards records to `tracing` at a severity-derived level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingBackend;

impl AuditBackend for TracingBackend {
    fn record(&mut self, record: &AuditRecord) {
        let kind = record.event.kind();
        let detail = serde_json::to_string(&record.event).unwrap_or_default();
        match record.severity {
            Severity::Fault | Severity::Error => {
                error!(target: "caravel::audit", kind, %detail, severity = ?record.severity);
            }
            Severity::Default => {
                warn!(target: "caravel::audit", kind, %detail);
            }
            Severity::Info => {
                info!(target: "caravel::audit", kind, %detail);
            }
        }
    }
}

/// Backend that captures records into shared memory.
pub struct MemoryBackend {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl AuditBackend for MemoryBackend {
    fn record(&mut self, record: &AuditRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

/// Snapshot accessor for records captured by a [`MemoryBackend`].
#[derive(Debug, Clone, Default)]
pub struct MemoryHandle {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryHandle {
    /// Snapshot of all captured records, in arrival order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Events of the snapshot, without timestamps.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.snapshot().into_iter().map(|r| r.event).collect()
    }

    /// Whether any captured event has the given kind name.
    #[must_use]
    pub fn contains_kind(&self, kind: &str) -> bool {
        self.snapshot().iter().any(|r| r.event.kind() == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sink_captures_in_order() {
        let (sink, handle) = AuditSink::memory();
        sink.emit(AuditEvent::SignatureVerified {
            algorithm: "test".into(),
        });
        sink.emit(AuditEvent::ZipBombDetected { declared_total: 1 });
        sink.flush().await;

        let events = handle.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "signature_verified");
        assert_eq!(events[1].kind(), "zip_bomb_detected");
        assert!(handle.contains_kind("zip_bomb_detected"));
        assert!(!handle.contains_kind("checksum_mismatch"));
    }

    #[tokio::test]
    async fn records_carry_severity() {
        let (sink, handle) = AuditSink::memory();
        sink.emit(AuditEvent::PathTraversalAttempt {
            entry: "../x".into(),
        });
        sink.flush().await;

        let records = handle.snapshot();
        assert_eq!(records[0].severity, Severity::Fault);
    }

    #[tokio::test]
    async fn clones_share_the_worker() {
        let (sink, handle) = AuditSink::memory();
        let clone = sink.clone();
        clone.emit(AuditEvent::IntegrityCheckPassed {
            module: "m".into(),
        });
        sink.flush().await;
        assert_eq!(handle.snapshot().len(), 1);
    }
}
