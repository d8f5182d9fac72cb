//! `eolforce-memory` – Test Records & History
//!
//! Everything a finished test leaves behind on disk.
//!
//! # Modules
//!
//! - [`sink`] – [`RecordSink`][sink::RecordSink]: the writer contract the
//!   engine hands a finalized record to, the [`SinkError`][sink::SinkError]
//!   taxonomy, an in-memory sink for tests and the
//!   [`RecordArchive`][sink::RecordArchive] that chains the JSON writer
//!   with the history index.
//! - [`json`] – [`JsonRecordWriter`][json::JsonRecordWriter]: one JSON file
//!   per test, written atomically (temporary file, fsync, rename), and
//!   [`read_record`][json::read_record].
//! - [`history`] – [`HistoryStore`][history::HistoryStore]: SQLite summary
//!   index of finished tests with per-serial lookup and yield statistics.

pub mod history;
pub mod json;
pub mod sink;

pub use history::{HistoryStore, RunSummary, YieldStats};
pub use json::{JsonRecordWriter, read_record};
pub use sink::{MemorySink, RecordArchive, RecordSink, SinkError, WriteReceipt};
