//! Caravel Audit - security event taxonomy and delivery.
//!
//! The pipeline emits a closed set of severity-tagged [`AuditEvent`]s. The
//! [`AuditSink`] hands them to a dedicated worker task so emitters never
//! block and no event is dropped under backpressure; backends decide what a
//! recorded event becomes (a `tracing` line, a file, a test buffer).

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod event;
mod sink;

pub use event::{AuditEvent, AuditRecord, Severity};
pub use sink::{AuditBackend, AuditSink, MemoryBackend, MemoryHandle, TracingBackend};
