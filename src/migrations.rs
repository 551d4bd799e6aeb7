//! Schema migration framework.
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`.
//! Each migration runs exactly once, tracked by the `schema_version` table.
//! A hot backup is taken before any pending migration is applied.

use rusqlite::Connection;
use thiserror::Error;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/001_baseline.sql"),
}];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(
        "Database schema version ({found}) is newer than this build supports ({supported}); \
         update callwatch"
    )]
    SchemaTooNew { found: i32, supported: i32 },

    #[error("Migration v{version} failed: {source}")]
    Apply {
        version: i32,
        source: rusqlite::Error,
    },

    #[error("Pre-migration backup failed: {0}")]
    Backup(String),
}

fn ensure_schema_version_table(conn: &Connection) -> Result<(), MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    Ok(())
}

fn current_version(conn: &Connection) -> Result<i32, MigrationError> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Take a hot copy of the database at `<db_path>.pre-migration.bak` using
/// SQLite's online backup API. In-memory databases are skipped.
fn backup_before_migration(conn: &Connection) -> Result<(), MigrationError> {
    let db_path: String = conn
        .query_row("PRAGMA database_list", [], |row| row.get(2))
        .map_err(|e| MigrationError::Backup(e.to_string()))?;

    if db_path.is_empty() || db_path == ":memory:" {
        return Ok(());
    }

    let backup_path = format!("{}.pre-migration.bak", db_path);
    let mut backup_conn = Connection::open(&backup_path)
        .map_err(|e| MigrationError::Backup(format!("open {}: {}", backup_path, e)))?;

    let backup = rusqlite::backup::Backup::new(conn, &mut backup_conn)
        .map_err(|e| MigrationError::Backup(e.to_string()))?;
    backup
        .step(-1)
        .map_err(|e| MigrationError::Backup(e.to_string()))?;

    log::info!("Pre-migration backup created at {}", backup_path);
    Ok(())
}

/// Run all pending migrations. Returns the number applied (0 when the
/// schema is already current).
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    ensure_schema_version_table(conn)?;

    let current = current_version(conn)?;
    let max_known = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    if current > max_known {
        return Err(MigrationError::SchemaTooNew {
            found: current,
            supported: max_known,
        });
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }

    backup_before_migration(conn)?;

    for migration in &pending {
        conn.execute_batch(migration.sql)
            .map_err(|source| MigrationError::Apply {
                version: migration.version,
                source,
            })?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [migration.version],
        )?;
        log::info!("Applied migration v{}", migration.version);
    }

    Ok(pending.len())
}
