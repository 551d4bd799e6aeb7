//! SQLite-backed relational store for all pipeline state.
//!
//! Every cross-component transition is committed here; workers hold no
//! shared in-memory state. Each worker opens its own `Store`; the inner
//! mutex exists only to make the handle usable from an async task and is
//! never contended. WAL mode plus a busy timeout make the cross-handle
//! concurrency safe.

pub mod analysis;
mod equities;
mod groups;
pub mod outbox;
pub mod schedule;
mod transcripts;
pub mod types;

pub use analysis::{EnqueueOutcome, ANALYSIS_JOB_LEASE};

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use thiserror::Error;

use crate::migrations::{run_migrations, MigrationError};
use crate::retry::ErrorClass;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] MigrationError),

    #[error("Failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Row not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Classify for retry policy: lock contention is transient, constraint
    /// violations are permanent and handled idempotently by callers.
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => match e.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    ErrorClass::Transient
                }
                _ => ErrorClass::Permanent,
            },
            StoreError::Sqlite(_) | StoreError::Migration(_) | StoreError::NotFound(_) => {
                ErrorClass::Permanent
            }
            StoreError::CreateDir { .. } => ErrorClass::Transient,
        }
    }

    /// True when the error is a unique/foreign-key constraint violation.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

/// Connection wrapper over the pipeline database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply pending
    /// migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the handle's connection. Single-statement callers can chain
    /// off the returned guard; multi-statement callers (prepared queries,
    /// transactions) must bind it to keep the borrow alive.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection lock")
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    /// Fixed instant used across store tests: 2026-01-10 09:00 UTC, which
    /// sits inside Q4 FY26 (target quarter Q3 FY26).
    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 9, 0, 0).unwrap()
    }

    pub fn store() -> Store {
        Store::open_in_memory().expect("open in-memory store")
    }

    /// Insert an equity and return its id.
    pub fn seed_equity(store: &Store, identifier: &str, symbol: &str) -> i64 {
        store
            .insert_equity(Some(symbol), None, identifier, &format!("{} Ltd", symbol), t0())
            .expect("insert equity")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let store = Store::open_in_memory().expect("open");
        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM equities", [], |row| row.get(0))
            .expect("equities table exists");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_open_on_disk_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("pipeline.db");
        let _first = Store::open(&path).expect("first open");
        let _second = Store::open(&path).expect("second open");
    }

    #[test]
    fn test_constraint_violation_classified_permanent() {
        let store = Store::open_in_memory().expect("open");
        let now = test_support::t0();
        store
            .insert_equity(Some("ACME"), None, "INE-ACME", "Acme", now)
            .expect("first insert");
        let err = store
            .insert_equity(Some("ACME"), None, "INE-ACME", "Acme", now)
            .unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(err.class(), ErrorClass::Permanent);
    }
}
