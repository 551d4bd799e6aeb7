//! Equities and watchlist membership.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::types::Equity;
use super::{Store, StoreError};
use crate::clock::ts;

fn equity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Equity> {
    Ok(Equity {
        id: row.get(0)?,
        symbol: row.get(1)?,
        alt_code: row.get(2)?,
        identifier: row.get(3)?,
        name: row.get(4)?,
    })
}

const EQUITY_COLS: &str = "id, symbol, alt_code, identifier, name";

impl Store {
    /// Insert an equity. The `identifier` is unique; a duplicate insert is
    /// a constraint violation for the caller to handle.
    pub fn insert_equity(
        &self,
        symbol: Option<&str>,
        alt_code: Option<&str>,
        identifier: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO equities (symbol, alt_code, identifier, name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![symbol, alt_code, identifier, name, ts(now)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_equity(&self, id: i64) -> Result<Option<Equity>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM equities WHERE id = ?1", EQUITY_COLS),
                params![id],
                equity_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_equity_by_identifier(&self, identifier: &str) -> Result<Option<Equity>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM equities WHERE identifier = ?1", EQUITY_COLS),
                params![identifier],
                equity_from_row,
            )
            .optional()?;
        Ok(row)
    }

    // =========================================================================
    // Watchlist
    // =========================================================================

    /// Add an equity to the watchlist. Idempotent.
    pub fn add_to_watchlist(&self, equity_id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO watchlist_items (equity_id, added_at) VALUES (?1, ?2)",
            params![equity_id, ts(now)],
        )?;
        Ok(())
    }

    pub fn remove_from_watchlist(&self, equity_id: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM watchlist_items WHERE equity_id = ?1",
            params![equity_id],
        )?;
        Ok(())
    }

    pub fn is_on_watchlist(&self, equity_id: i64) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM watchlist_items WHERE equity_id = ?1 LIMIT 1",
                params![equity_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn watchlist_equity_ids(&self) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT equity_id FROM watchlist_items ORDER BY equity_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Equity ids that belong to at least one active group.
    pub fn active_group_equity_ids(&self) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT gm.equity_id
             FROM group_memberships gm
             JOIN groups g ON g.id = gm.group_id
             WHERE g.is_active = 1
             ORDER BY gm.equity_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }
}
