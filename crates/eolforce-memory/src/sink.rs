//! [`RecordSink`] – destination of finalized test records.
//!
//! The engine calls [`RecordSink::write`] exactly once per test, with a
//! record whose verdict is already decided.  A failing sink is logged by the
//! caller; it never changes the verdict.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use eolforce_types::TestRecord;
use thiserror::Error;
use tracing::{info, warn};

use crate::history::HistoryStore;
use crate::json::JsonRecordWriter;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl SinkError {
    pub(crate) fn background(err: tokio::task::JoinError) -> Self {
        SinkError::Io(std::io::Error::other(format!("writer task failed: {err}")))
    }
}

/// Where a record ended up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReceipt {
    /// Persisted file, for file-backed sinks.
    pub path: Option<PathBuf>,
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write(&self, record: &TestRecord) -> Result<WriteReceipt, SinkError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// MemorySink
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps every written record in memory.  Cloning shares the store.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<TestRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TestRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<TestRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write(&self, record: &TestRecord) -> Result<WriteReceipt, SinkError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(WriteReceipt::default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordArchive
// ─────────────────────────────────────────────────────────────────────────────

/// The station's production sink: JSON file first, then the optional
/// history index pointing at it.
///
/// An index failure is logged and does not fail the write; the JSON file is
/// the record of truth.
pub struct RecordArchive {
    writer: JsonRecordWriter,
    history: Option<Arc<HistoryStore>>,
}

impl RecordArchive {
    pub fn new(writer: JsonRecordWriter) -> Self {
        Self {
            writer,
            history: None,
        }
    }

    pub fn with_history(mut self, history: Arc<HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn history(&self) -> Option<&Arc<HistoryStore>> {
        self.history.as_ref()
    }
}

#[async_trait]
impl RecordSink for RecordArchive {
    async fn write(&self, record: &TestRecord) -> Result<WriteReceipt, SinkError> {
        let receipt = self.writer.write(record).await?;
        if let Some(history) = &self.history {
            let history = Arc::clone(history);
            let summary = crate::history::RunSummary::from_record(record, receipt.path.clone());
            let indexed = tokio::task::spawn_blocking(move || history.insert(&summary))
                .await
                .map_err(SinkError::background)
                .and_then(|r| r);
            match indexed {
                Ok(()) => info!(id = %record.id, "record indexed"),
                Err(err) => warn!(id = %record.id, error = %err, "history index update failed"),
            }
        }
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use eolforce_types::{DutIdentity, Profile, Verdict};

    fn record(serial: &str, verdict: Verdict) -> TestRecord {
        let dut = DutIdentity::new(serial, "PN-7", "op-1", "EOL-01");
        let mut r = TestRecord::new(dut, Profile::default(), Utc::now());
        r.finalize(verdict, "force_out_of_band", Utc::now());
        r
    }

    #[tokio::test]
    async fn memory_sink_keeps_records_in_order() {
        let sink = MemorySink::new();
        sink.write(&record("A1", Verdict::Pass)).await.unwrap();
        sink.write(&record("A2", Verdict::Fail)).await.unwrap();
        let records = sink.clone().records();
        assert_eq!(records.len(), 2);
        assert_eq!(sink.last().unwrap().dut.serial_number, "A2");
    }

    #[tokio::test]
    async fn archive_writes_file_and_indexes_it() {
        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let archive = RecordArchive::new(JsonRecordWriter::new(dir.path()))
            .with_history(Arc::clone(&history));

        let r = record("SN-100", Verdict::Fail);
        let receipt = archive.write(&r).await.unwrap();
        let path = receipt.path.unwrap();
        assert!(path.exists());

        let rows = history.by_serial("SN-100").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, r.id);
        assert_eq!(rows[0].record_path.as_deref(), Some(path.as_path()));
    }
}
