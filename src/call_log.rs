//! The observability sink: an append-only log of every outbound provider
//! call.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use crate::providers::ProviderId;
use crate::results::iso_timestamp;
use crate::Result;

/// One structured call record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallRecord {
    pub timestamp: String,
    pub provider: ProviderId,
    /// Request URL with credential parameters redacted.
    pub url: String,
    pub status: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_summary: Option<String>,
}

impl CallRecord {
    pub fn new(provider: ProviderId, url: String, status: String, duration_ms: u64) -> CallRecord {
        CallRecord {
            timestamp: iso_timestamp(),
            provider,
            url,
            status,
            duration_ms,
            error: None,
            response_summary: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> CallRecord {
        self.error = Some(error.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> CallRecord {
        self.response_summary = Some(summary.into());
        self
    }
}

/// Where call records go. Injected into every adapter.
pub trait CallLog: Send + Sync + 'static {
    fn record(&self, record: CallRecord);
}

/// Discards everything.
pub struct NullLog;

impl CallLog for NullLog {
    fn record(&self, _record: CallRecord) {}
}

/// Appends one JSON object per line to a file.
pub struct JsonLinesLog {
    file: Mutex<File>,
}

impl JsonLinesLog {
    pub fn open(path: &Path) -> Result<JsonLinesLog> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JsonLinesLog {
            file: Mutex::new(file),
        })
    }
}

impl CallLog for JsonLinesLog {
    fn record(&self, record: CallRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                warn!("could not serialize call record: {}", err);
                return;
            }
        };
        let mut file = self.file.lock().expect("call log mutex poisoned");
        if let Err(err) = writeln!(file, "{}", line) {
            warn!("could not append to call log: {}", err);
        }
    }
}

/// Collects records in memory. Used by tests to assert on call counts.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryLog {
    records: Mutex<Vec<CallRecord>>,
}

#[cfg(test)]
impl MemoryLog {
    pub fn new() -> MemoryLog {
        MemoryLog::default()
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.records.lock().expect("memory log mutex poisoned").clone()
    }
}

#[cfg(test)]
impl CallLog for MemoryLog {
    fn record(&self, record: CallRecord) {
        self.records
            .lock()
            .expect("memory log mutex poisoned")
            .push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_lines_log_appends_one_object_per_line() {
        let dir = std::env::temp_dir().join("geofuse-call-log-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("log-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let log = JsonLinesLog::open(&path).unwrap();
        log.record(CallRecord::new(
            ProviderId::Here,
            "https://geocode.search.hereapi.com/v1/geocode?q=x".to_owned(),
            "OK".to_owned(),
            42,
        ));
        log.record(
            CallRecord::new(
                ProviderId::Osm,
                "https://nominatim.openstreetmap.org/search?q=y".to_owned(),
                "ERROR".to_owned(),
                7,
            )
            .with_error("timeout"),
        );

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: CallRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.provider, ProviderId::Here);
        let second: CallRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.error.as_deref(), Some("timeout"));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn memory_log_collects_in_order() {
        let log = MemoryLog::new();
        log.record(CallRecord::new(ProviderId::Google, "u1".to_owned(), "OK".to_owned(), 1));
        log.record(CallRecord::new(ProviderId::Google, "u2".to_owned(), "OK".to_owned(), 2));
        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].url, "u1");
        assert_eq!(records[1].url, "u2");
    }
}
