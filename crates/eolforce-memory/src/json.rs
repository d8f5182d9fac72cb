//! [`JsonRecordWriter`] – one JSON file per finished test.
//!
//! # Atomicity
//!
//! A record is serialized in memory, written to a uniquely named temporary
//! file in the target directory, flushed and fsynced, then renamed over its
//! final name; the directory is fsynced last.  Readers therefore see either
//! no file or a complete one.
//!
//! File name: `<serial>_<YYYYMMDDTHHMMSS>_<test id>.json` (see
//! [`TestRecord::file_name`]).

use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use eolforce_types::TestRecord;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::sink::{RecordSink, SinkError, WriteReceipt};

/// Atomic JSON writer rooted at a record directory.
#[derive(Debug, Clone)]
pub struct JsonRecordWriter {
    dir: PathBuf,
}

impl JsonRecordWriter {
    /// The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Serialize `record` and persist it atomically.  Returns the final path.
    pub async fn write(&self, record: &TestRecord) -> Result<WriteReceipt, SinkError> {
        let mut bytes = serde_json::to_vec_pretty(record)?;
        bytes.push(b'\n');
        let dir = self.dir.clone();
        let target = dir.join(record.file_name());
        let path = tokio::task::spawn_blocking(move || write_atomic(&dir, &target, &bytes).map(|()| target))
            .await
            .map_err(SinkError::background)??;
        info!(id = %record.id, verdict = %record.verdict, path = %path.display(), "record written");
        Ok(WriteReceipt { path: Some(path) })
    }
}

#[async_trait]
impl RecordSink for JsonRecordWriter {
    async fn write(&self, record: &TestRecord) -> Result<WriteReceipt, SinkError> {
        JsonRecordWriter::write(self, record).await
    }
}

fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), SinkError> {
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| SinkError::Io(e.error))?;
    sync_dir(dir)?;
    debug!(path = %target.display(), bytes = bytes.len(), "persisted");
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Load a record previously written by [`JsonRecordWriter`].
pub fn read_record(path: &Path) -> Result<TestRecord, SinkError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
