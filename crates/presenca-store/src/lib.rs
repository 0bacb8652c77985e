//! presenca-store: SQLite persistence for students, attendances and school units.
//!
//! Implements the relational store traits of `presenca-core` on top of
//! `tokio-rusqlite`, which runs every statement on a dedicated connection
//! thread.

mod attendance;
mod students;
mod units;

pub use attendance::{AttendanceFilter, AttendanceRow};
pub use units::{NewSchoolUnit, SchoolUnit};

use chrono::{DateTime, SecondsFormat, Utc};
use presenca_core::StoreError;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS school_units (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    ip_range_start TEXT,
    ip_range_end TEXT
);

CREATE TABLE IF NOT EXISTS students (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL,
    class_name TEXT NOT NULL,
    shift TEXT NOT NULL,
    age INTEGER NOT NULL,
    image_path TEXT NOT NULL,
    school_unit_id INTEGER REFERENCES school_units (id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS attendances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    client_ip TEXT
);

CREATE INDEX IF NOT EXISTS idx_attendances_student_time
    ON attendances (student_id, timestamp);
";

#[derive(Error, Debug)]
pub enum Error {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("unknown {0}")]
    InvalidReference(String),
    #[error("cannot create database directory: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Error> for StoreError {
    fn from(e: Error) -> Self {
        match e {
            Error::Conflict(what) => StoreError::Conflict(what),
            Error::InvalidReference(what) => StoreError::InvalidReference(what),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Handle to the attendance database. Cheap to clone.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).await?;
        conn.call(|c| {
            let mode: String = c.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            tracing::debug!(journal_mode = %mode, "sqlite journal mode");
            Ok(())
        })
        .await?;
        let store = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "attendance database ready");
        Ok(store)
    }

    /// Private in-memory database, for tests and dry runs.
    pub async fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|c| {
            c.pragma_update(None, "foreign_keys", true)?;
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

/// Fixed-width RFC 3339 in UTC, so text order equals time order.
pub(crate) fn timestamp_text(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

/// Which constraint a failed statement tripped, if any we report distinctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Violation {
    Unique,
    ForeignKey,
}

pub(crate) fn violation(e: &tokio_rusqlite::Error) -> Option<Violation> {
    let tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(f, _)) = e else {
        return None;
    };
    match f.extended_code {
        rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => Some(Violation::Unique),
        rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Some(Violation::ForeignKey),
        _ => None,
    }
}

/// Map a student write failure onto the store error it stands for.
pub(crate) fn student_write_error(student_id: &str, school_unit_id: Option<i64>, e: tokio_rusqlite::Error) -> Error {
    match violation(&e) {
        Some(Violation::Unique) => Error::Conflict(format!("student {student_id}")),
        Some(Violation::ForeignKey) => Error::InvalidReference(match school_unit_id {
            Some(unit) => format!("school unit {unit}"),
            None => "school unit".to_string(),
        }),
        None => Error::Sqlite(e),
    }
}
