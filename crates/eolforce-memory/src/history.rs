//! Test history index.
//!
//! Keeps one summary row per finished test in a local SQLite database so the
//! station can answer "what happened to this serial?" and report yield
//! without re-reading every JSON record.
//!
//! # Storage layout
//!
//! | column       | type    | description                                |
//! |--------------|---------|--------------------------------------------|
//! | id           | TEXT    | test id (UUID v4), primary key             |
//! | serial       | TEXT    | DUT serial number                          |
//! | part_number  | TEXT    |                                            |
//! | station      | TEXT    |                                            |
//! | operator     | TEXT    |                                            |
//! | profile      | TEXT    | profile name                               |
//! | verdict      | TEXT    | `PASS` / `FAIL` / `ABORTED` / `ERROR`      |
//! | cause        | TEXT    | empty on PASS                              |
//! | started_at   | TEXT    | RFC-3339 (UTC)                             |
//! | ended_at     | TEXT    | RFC-3339 (UTC)                             |
//! | cycles       | INTEGER | number of recorded cycles                  |
//! | record_path  | TEXT    | JSON record file, if one was written       |

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use eolforce_types::{TestRecord, Verdict};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sink::SinkError;

/// One indexed test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub serial_number: String,
    pub part_number: String,
    pub station: String,
    pub operator: String,
    pub profile: String,
    pub verdict: Verdict,
    pub cause: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub cycles: u32,
    pub record_path: Option<PathBuf>,
}

impl RunSummary {
    pub fn from_record(record: &TestRecord, record_path: Option<PathBuf>) -> Self {
        Self {
            id: record.id,
            serial_number: record.dut.serial_number.clone(),
            part_number: record.dut.part_number.clone(),
            station: record.station.clone(),
            operator: record.operator.clone(),
            profile: record.profile.name.clone(),
            verdict: record.verdict,
            cause: record.cause.clone(),
            started_at: record.started_at,
            ended_at: record.ended_at,
            cycles: record.cycles().len() as u32,
            record_path,
        }
    }
}

/// Verdict counts over the whole history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct YieldStats {
    pub total: u64,
    pub pass: u64,
    pub fail: u64,
    pub aborted: u64,
    pub error: u64,
}

impl YieldStats {
    /// Passing share of all tests, `0.0` for an empty history.
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.pass as f64 / self.total as f64
        }
    }

    /// Passing share of tests that reached a verdict on the part
    /// (PASS or FAIL), ignoring aborted and errored runs.
    pub fn first_pass_yield(&self) -> f64 {
        let decided = self.pass + self.fail;
        if decided == 0 {
            0.0
        } else {
            self.pass as f64 / decided as f64
        }
    }
}

/// SQLite-backed history of finished tests.
pub struct HistoryStore {
    conn: Mutex<Connection>,
}

const COLUMNS: &str = "id, serial, part_number, station, operator, profile, verdict, cause, \
                       started_at, ended_at, cycles, record_path";

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(column, message, Type::Text)
}

/// Fixed-width so that text order is time order.
fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(column: usize, raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| conversion_error(column, e.to_string()))
}

fn summary_from_row(row: &Row<'_>) -> Result<RunSummary, rusqlite::Error> {
    let id: String = row.get(0)?;
    let verdict: String = row.get(6)?;
    let started: String = row.get(8)?;
    let ended: String = row.get(9)?;
    let path: Option<String> = row.get(11)?;
    Ok(RunSummary {
        id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e.to_string()))?,
        serial_number: row.get(1)?,
        part_number: row.get(2)?,
        station: row.get(3)?,
        operator: row.get(4)?,
        profile: row.get(5)?,
        verdict: Verdict::parse(&verdict)
            .ok_or_else(|| conversion_error(6, format!("unknown verdict '{verdict}'")))?,
        cause: row.get(7)?,
        started_at: parse_time(8, &started)?,
        ended_at: parse_time(9, &ended)?,
        cycles: row.get(10)?,
        record_path: path.map(PathBuf::from),
    })
}

impl HistoryStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, SinkError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, SinkError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS test_runs (
                id          TEXT NOT NULL PRIMARY KEY,
                serial      TEXT NOT NULL,
                part_number TEXT NOT NULL,
                station     TEXT NOT NULL,
                operator    TEXT NOT NULL,
                profile     TEXT NOT NULL,
                verdict     TEXT NOT NULL,
                cause       TEXT NOT NULL,
                started_at  TEXT NOT NULL,
                ended_at    TEXT NOT NULL,
                cycles      INTEGER NOT NULL,
                record_path TEXT
            );
            CREATE INDEX IF NOT EXISTS test_runs_serial ON test_runs (serial);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the row of `summary.id`.
    pub fn insert(&self, summary: &RunSummary) -> Result<(), SinkError> {
        self.conn().execute(
            &format!("INSERT OR REPLACE INTO test_runs ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
            params![
                summary.id.to_string(),
                summary.serial_number,
                summary.part_number,
                summary.station,
                summary.operator,
                summary.profile,
                summary.verdict.as_str(),
                summary.cause,
                rfc3339(summary.started_at),
                rfc3339(summary.ended_at),
                summary.cycles,
                summary.record_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
            ],
        )?;
        Ok(())
    }

    /// Index a finished record.
    pub fn index(&self, record: &TestRecord, record_path: Option<PathBuf>) -> Result<(), SinkError> {
        self.insert(&RunSummary::from_record(record, record_path))
    }

    /// The `limit` most recent tests, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<RunSummary>, SinkError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM test_runs ORDER BY started_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], summary_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every test of `serial`, oldest first.
    pub fn by_serial(&self, serial: &str) -> Result<Vec<RunSummary>, SinkError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM test_runs WHERE serial = ?1 ORDER BY started_at ASC"
        ))?;
        let rows = stmt.query_map(params![serial], summary_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn yield_stats(&self) -> Result<YieldStats, SinkError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT verdict, COUNT(*) FROM test_runs GROUP BY verdict")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut stats = YieldStats::default();
        for row in rows {
            let (verdict, count) = row?;
            let count = count.max(0) as u64;
            stats.total += count;
            match Verdict::parse(&verdict) {
                Some(Verdict::Pass) => stats.pass += count,
                Some(Verdict::Fail) => stats.fail += count,
                Some(Verdict::Aborted) => stats.aborted += count,
                Some(Verdict::Error) | None => stats.error += count,
            }
        }
        Ok(stats)
    }
}
