//! Shared helpers for in-crate unit tests.

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};
use zip::write::SimpleFileOptions;

use caravel_core::Clock;

/// Deterministic, manually advanced clock.
#[derive(Debug)]
pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub(crate) fn arc() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap()),
        })
    }

    pub(crate) fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Build an in-memory ZIP archive from `(entry_name, bytes)` pairs.
pub(crate) fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for &(name, data) in entries {
        writer
            .start_file(name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Build a ZIP archive containing a symlink entry.
pub(crate) fn build_zip_with_symlink(link_name: &str, target: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .add_symlink(link_name, target, SimpleFileOptions::default())
        .unwrap();
    writer.finish().unwrap().into_inner()
}
