//! The fetch schedule: one row per tracked `(equity, quarter, year)`.
//!
//! A row is claimable iff `next_check_at <= now` and any lock has lapsed.
//! Claims take a lease; the fetcher's completion update clears it. If the
//! fetcher dies mid-check, the lease expires and the row is claimable
//! again.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

use super::types::FetchScheduleRow;
use super::{Store, StoreError};
use crate::clock::{parse_ts, ts};
use crate::fiscal::{Quarter, QuarterYear};

/// Priority lanes (lower wins).
pub const PRIORITY_WATCHLIST: i64 = 10;
pub const PRIORITY_GROUP: i64 = 20;
pub const PRIORITY_RECONCILE: i64 = 90;
pub const PRIORITY_RETIRED: i64 = 99;

/// How long a claimed schedule row stays invisible to other claimants.
pub const SCHEDULE_LEASE: Duration = Duration::seconds(120);

/// Rows with no availability this long after their last available sighting
/// are soft-retired.
pub const RETIRE_AFTER: Duration = Duration::days(90);

fn row_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FetchScheduleRow> {
    let quarter: String = row.get(2)?;
    let next_check_at: Option<String> = row.get(5)?;
    let last_checked_at: Option<String> = row.get(7)?;
    let last_available_at: Option<String> = row.get(8)?;
    let locked_until: Option<String> = row.get(10)?;
    Ok(FetchScheduleRow {
        id: row.get(0)?,
        equity_id: row.get(1)?,
        quarter: quarter.parse::<Quarter>().unwrap_or(Quarter::Q1),
        year: row.get(3)?,
        priority: row.get(4)?,
        next_check_at: next_check_at.as_deref().and_then(parse_ts),
        last_status: row.get(6)?,
        last_checked_at: last_checked_at.as_deref().and_then(parse_ts),
        last_available_at: last_available_at.as_deref().and_then(parse_ts),
        attempts: row.get(9)?,
        locked_until: locked_until.as_deref().and_then(parse_ts),
    })
}

const SCHEDULE_COLS: &str = "id, equity_id, quarter, year, priority, next_check_at, last_status, \
                             last_checked_at, last_available_at, attempts, locked_until";

impl Store {
    /// Ensure a schedule row exists for the slot. An existing row keeps
    /// its `next_check_at` (so sync never resets in-flight cadence) but
    /// adopts the new priority.
    pub fn ensure_schedule_row(
        &self,
        equity_id: i64,
        slot: QuarterYear,
        priority: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO fetch_schedule
                 (equity_id, quarter, year, priority, next_check_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?5)
             ON CONFLICT(equity_id, quarter, year) DO UPDATE SET
                 priority = excluded.priority,
                 next_check_at = COALESCE(fetch_schedule.next_check_at, excluded.next_check_at),
                 updated_at = excluded.updated_at",
            params![
                equity_id,
                slot.quarter.as_str(),
                slot.year,
                priority,
                ts(now)
            ],
        )?;
        Ok(())
    }

    /// Drop schedule rows for equities that left every tracked set.
    pub fn delete_untracked_schedule_rows(&self, tracked: &[i64]) -> Result<usize, StoreError> {
        if tracked.is_empty() {
            let deleted = self.conn().execute("DELETE FROM fetch_schedule", [])?;
            return Ok(deleted);
        }
        let placeholders = tracked.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "DELETE FROM fetch_schedule WHERE equity_id NOT IN ({})",
            placeholders
        );
        let deleted = self
            .conn()
            .execute(&sql, rusqlite::params_from_iter(tracked.iter()))?;
        Ok(deleted)
    }

    pub fn get_schedule_row(&self, id: i64) -> Result<Option<FetchScheduleRow>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM fetch_schedule WHERE id = ?1", SCHEDULE_COLS),
                params![id],
                row_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_schedule_for_slot(
        &self,
        equity_id: i64,
        slot: QuarterYear,
    ) -> Result<Option<FetchScheduleRow>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM fetch_schedule
                     WHERE equity_id = ?1 AND quarter = ?2 AND year = ?3",
                    SCHEDULE_COLS
                ),
                params![equity_id, slot.quarter.as_str(), slot.year],
                row_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Atomically claim up to `limit` due rows, most urgent first, taking
    /// the schedule lease on each.
    pub fn claim_due_schedule(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<FetchScheduleRow>, StoreError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let rows = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM fetch_schedule
                 WHERE next_check_at IS NOT NULL AND next_check_at <= ?1
                   AND (locked_until IS NULL OR locked_until < ?1)
                 ORDER BY priority ASC, next_check_at ASC
                 LIMIT ?2",
                SCHEDULE_COLS
            ))?;
            let result = stmt
                .query_map(params![ts(now), limit as i64], row_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            result
        };

        let lock_until = ts(now + SCHEDULE_LEASE);
        for row in &rows {
            tx.execute(
                "UPDATE fetch_schedule SET locked_until = ?1, updated_at = ?2 WHERE id = ?3",
                params![lock_until, ts(now), row.id],
            )?;
        }
        tx.commit()?;
        Ok(rows)
    }

    /// Record a completed check: set the observed status, schedule the next
    /// poll, reset the error streak, and release the lock.
    pub fn complete_check(
        &self,
        schedule_id: i64,
        last_status: &str,
        next_check_at: DateTime<Utc>,
        available: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE fetch_schedule
             SET last_status = ?1, last_checked_at = ?2,
                 last_available_at = CASE WHEN ?3 THEN ?2 ELSE last_available_at END,
                 next_check_at = ?4, attempts = 0, locked_until = NULL, updated_at = ?2
             WHERE id = ?5",
            params![
                last_status,
                ts(now),
                available,
                ts(next_check_at),
                schedule_id
            ],
        )?;
        Ok(())
    }

    /// Record a failed check. Transient failures keep `last_status`
    /// untouched and grow the attempt streak; permanent ones set
    /// `last_status = 'error'` with the streak reset.
    pub fn record_check_error(
        &self,
        schedule_id: i64,
        permanent: bool,
        next_check_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        if permanent {
            self.conn().execute(
                "UPDATE fetch_schedule
                 SET last_status = 'error', last_checked_at = ?1, next_check_at = ?2,
                     attempts = 0, locked_until = NULL, updated_at = ?1
                 WHERE id = ?3",
                params![ts(now), ts(next_check_at), schedule_id],
            )?;
            return Ok(0);
        }
        self.conn().execute(
            "UPDATE fetch_schedule
             SET last_checked_at = ?1, next_check_at = ?2,
                 attempts = attempts + 1, locked_until = NULL, updated_at = ?1
             WHERE id = ?3",
            params![ts(now), ts(next_check_at), schedule_id],
        )?;
        let attempts = self.conn().query_row(
            "SELECT attempts FROM fetch_schedule WHERE id = ?1",
            params![schedule_id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    /// Release a claimed row without recording a check (stale message).
    pub fn release_schedule_lock(&self, schedule_id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE fetch_schedule SET locked_until = NULL, updated_at = ?1 WHERE id = ?2",
            params![ts(now), schedule_id],
        )?;
        Ok(())
    }

    /// Reset a row for an immediate operator-triggered check, creating it
    /// if missing.
    pub fn trigger_schedule_now(
        &self,
        equity_id: i64,
        slot: QuarterYear,
        priority: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO fetch_schedule
                 (equity_id, quarter, year, priority, next_check_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?5)
             ON CONFLICT(equity_id, quarter, year) DO UPDATE SET
                 priority = excluded.priority,
                 next_check_at = excluded.next_check_at,
                 attempts = 0,
                 locked_until = NULL,
                 updated_at = excluded.updated_at",
            params![
                equity_id,
                slot.quarter.as_str(),
                slot.year,
                priority,
                ts(now)
            ],
        )?;
        Ok(())
    }

    /// Soft-retire rows outside the target quarter whose last availability
    /// is more than 90 days old: priority drops to the retired lane and
    /// polling slows to weekly. Returns the number retired.
    pub fn retire_stale_schedule_rows(
        &self,
        target: QuarterYear,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let cutoff = ts(now - RETIRE_AFTER);
        let retired = self.conn().execute(
            "UPDATE fetch_schedule
             SET priority = ?1, next_check_at = ?2, updated_at = ?3
             WHERE NOT (quarter = ?4 AND year = ?5)
               AND priority < ?1
               AND last_available_at IS NOT NULL AND last_available_at < ?6",
            params![
                PRIORITY_RETIRED,
                ts(now + Duration::days(7)),
                ts(now),
                target.quarter.as_str(),
                target.year,
                cutoff
            ],
        )?;
        Ok(retired)
    }

    /// Whether any watchlist row for the slot is still mid-cycle (due or
    /// claimed); used to defer the group-research sweep while a poll wave
    /// is in flight.
    pub fn schedule_wave_in_flight(
        &self,
        slot: QuarterYear,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM fetch_schedule fs
                 JOIN watchlist_items w ON w.equity_id = fs.equity_id
                 WHERE fs.quarter = ?1 AND fs.year = ?2
                   AND (fs.next_check_at <= ?3
                        OR (fs.locked_until IS NOT NULL AND fs.locked_until > ?3))
                 LIMIT 1",
                params![slot.quarter.as_str(), slot.year, ts(now)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}
