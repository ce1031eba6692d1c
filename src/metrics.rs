//! Request lifecycle events and the sinks that record them.
//!
//! The orchestrator reports each request at fixed points through [`MetricsSink`].
//! [`RequestLedger`] appends every record to a JSONL file.

use crate::translate::Dialect;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    SelectionComplete {
        provider: String,
        model: String,
        client_dialect: Dialect,
        streaming: bool,
    },
    UpstreamStart {
        provider: String,
        attempt: u32,
    },
    UpstreamComplete {
        status: u16,
        input_tokens: u64,
        output_tokens: u64,
        duration_ms: u64,
    },
    UpstreamFailed {
        status: u16,
        error_type: String,
        message: String,
        duration_ms: u64,
    },
    StreamClosed {
        input_tokens: u64,
        output_tokens: u64,
        duration_ms: u64,
        errored: bool,
    },
}

/// Callback invoked by the orchestrator. Implementations must not block for long.
pub trait MetricsSink: Send + Sync {
    fn record(&self, request_id: &str, event: LifecycleEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _request_id: &str, _event: LifecycleEvent) {}
}

/// Keeps every event in memory. Handy for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    events: Mutex<Vec<(String, LifecycleEvent)>>,
}

impl MemoryMetrics {
    pub fn events(&self) -> Vec<(String, LifecycleEvent)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl MetricsSink for MemoryMetrics {
    fn record(&self, request_id: &str, event: LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push((request_id.to_string(), event));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    #[serde(flatten)]
    pub event: LifecycleEvent,
}

impl LedgerEntry {
    pub fn new(request_id: impl Into<String>, event: LifecycleEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: request_id.into(),
            event,
        }
    }
}

/// Append-only JSONL file of lifecycle events, one line per event.
#[derive(Clone)]
pub struct RequestLedger {
    path: PathBuf,
    writer: Arc<Mutex<BufWriter<File>>>,
}

impl RequestLedger {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for RequestLedger {
    fn record(&self, request_id: &str, event: LifecycleEvent) {
        let entry = LedgerEntry::new(request_id, event);
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize ledger entry");
                return;
            }
        };
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            warn!(path = %self.path.display(), error = %e, "Failed to append ledger entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn closed(n: u64) -> LifecycleEvent {
        LifecycleEvent::StreamClosed {
            input_tokens: n,
            output_tokens: n * 2,
            duration_ms: 10,
            errored: false,
        }
    }

    fn read_entries(path: &Path) -> Vec<LedgerEntry> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_ledger_appends_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("ledger.jsonl");

        let ledger = RequestLedger::open(&path).unwrap();
        ledger.record(
            "req-1",
            LifecycleEvent::SelectionComplete {
                provider: "openai".into(),
                model: "gpt-4o-mini".into(),
                client_dialect: Dialect::Anthropic,
                streaming: true,
            },
        );
        ledger.record("req-1", closed(3));
        drop(ledger);

        let reopened = RequestLedger::open(&path).unwrap();
        assert_eq!(reopened.path(), path.as_path());
        reopened.record("req-2", closed(4));

        let entries = read_entries(&path);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].request_id, "req-1");
        assert_eq!(entries[1].event, closed(3));
        assert_eq!(entries[2].request_id, "req-2");
    }

    #[test]
    fn test_ledger_line_format() {
        let entry = LedgerEntry::new("req-9", closed(1));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["event"], "stream_closed");
        assert_eq!(json["request_id"], "req-9");
        assert_eq!(json["output_tokens"], 2);
    }

    #[test]
    fn test_shared_ledger_keeps_whole_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let ledger = RequestLedger::open(&path).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        ledger.record(&format!("req-{t}-{i}"), closed(i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(read_entries(&path).len(), 100);
    }

    #[test]
    fn test_memory_metrics_records_in_order() {
        let sink = MemoryMetrics::default();
        sink.record("a", closed(1));
        sink.record("b", closed(2));
        let ids: Vec<String> = sink.events().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, ["a", "b"]);
    }
}
