//! Transcript slots, the append-only event log, and the per-transcript
//! analysis reservation.
//!
//! A slot's `status` never regresses from `available` once a source URL is
//! set, and the first URL recorded for a slot sticks; the oracle is
//! eventually consistent and later polls may echo stale or alternate URLs.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::types::{AnalysisStatus, Transcript, TranscriptStatus};
use super::{Store, StoreError};
use crate::clock::{parse_ts, ts};
use crate::fiscal::{Quarter, QuarterYear};

fn transcript_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transcript> {
    let quarter: String = row.get(2)?;
    let status: String = row.get(6)?;
    let event_date: Option<String> = row.get(7)?;
    let analysis_status: Option<String> = row.get(8)?;
    Ok(Transcript {
        id: row.get(0)?,
        equity_id: row.get(1)?,
        quarter: quarter.parse::<Quarter>().unwrap_or(Quarter::Q1),
        year: row.get(3)?,
        source_url: row.get(4)?,
        content_path: row.get(5)?,
        status: TranscriptStatus::parse(&status).unwrap_or(TranscriptStatus::None),
        event_date: event_date.as_deref().and_then(parse_ts),
        analysis_status: analysis_status.as_deref().and_then(AnalysisStatus::parse),
        analysis_error: row.get(9)?,
    })
}

const TRANSCRIPT_COLS: &str = "id, equity_id, quarter, year, source_url, content_path, status, \
                               event_date, analysis_status, analysis_error";

impl Store {
    pub fn get_transcript(&self, id: i64) -> Result<Option<Transcript>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM transcripts WHERE id = ?1", TRANSCRIPT_COLS),
                params![id],
                transcript_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_transcript_for_slot(
        &self,
        equity_id: i64,
        slot: QuarterYear,
    ) -> Result<Option<Transcript>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM transcripts
                     WHERE equity_id = ?1 AND quarter = ?2 AND year = ?3",
                    TRANSCRIPT_COLS
                ),
                params![equity_id, slot.quarter.as_str(), slot.year],
                transcript_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Record an `available` observation. Returns
    /// `(transcript_id, became_available, first_url_for_slot)`.
    ///
    /// `became_available` is true only when the slot transitioned into
    /// `available` on this call; an already-available slot keeps its
    /// original URL.
    pub fn upsert_available(
        &self,
        equity_id: i64,
        slot: QuarterYear,
        source_url: &str,
        event_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(i64, bool, bool), StoreError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        let existing: Option<(i64, String, Option<String>)> = tx
            .query_row(
                "SELECT id, status, source_url FROM transcripts
                 WHERE equity_id = ?1 AND quarter = ?2 AND year = ?3",
                params![equity_id, slot.quarter.as_str(), slot.year],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let result = match existing {
            None => {
                tx.execute(
                    "INSERT INTO transcripts
                         (equity_id, quarter, year, source_url, status, event_date,
                          created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'available', ?5, ?6, ?6)",
                    params![
                        equity_id,
                        slot.quarter.as_str(),
                        slot.year,
                        source_url,
                        event_date.map(ts),
                        ts(now)
                    ],
                )?;
                (tx.last_insert_rowid(), true, true)
            }
            Some((id, status, prior_url)) => {
                if status == "available" {
                    (id, false, prior_url.as_deref() == Some(source_url))
                } else {
                    tx.execute(
                        "UPDATE transcripts
                         SET status = 'available', source_url = ?1,
                             event_date = COALESCE(?2, event_date), updated_at = ?3
                         WHERE id = ?4",
                        params![source_url, event_date.map(ts), ts(now), id],
                    )?;
                    (id, true, true)
                }
            }
        };

        tx.commit()?;
        Ok(result)
    }

    /// Record an `upcoming` observation. Never regresses an `available`
    /// slot. Returns the transcript id.
    pub fn upsert_upcoming(
        &self,
        equity_id: i64,
        slot: QuarterYear,
        event_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, status FROM transcripts
                 WHERE equity_id = ?1 AND quarter = ?2 AND year = ?3",
                params![equity_id, slot.quarter.as_str(), slot.year],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let id = match existing {
            None => {
                tx.execute(
                    "INSERT INTO transcripts
                         (equity_id, quarter, year, status, event_date, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'upcoming', ?4, ?5, ?5)",
                    params![
                        equity_id,
                        slot.quarter.as_str(),
                        slot.year,
                        event_date.map(ts),
                        ts(now)
                    ],
                )?;
                tx.last_insert_rowid()
            }
            Some((id, status)) => {
                if status != "available" {
                    tx.execute(
                        "UPDATE transcripts
                         SET status = 'upcoming', event_date = COALESCE(?1, event_date),
                             updated_at = ?2
                         WHERE id = ?3",
                        params![event_date.map(ts), ts(now), id],
                    )?;
                }
                id
            }
        };

        tx.commit()?;
        Ok(id)
    }

    /// Append an observation to the event log. Returns `false` when an
    /// identical-URL observation already exists for the slot (the unique
    /// index swallows the duplicate).
    pub fn record_event(
        &self,
        equity_id: i64,
        slot: QuarterYear,
        status: TranscriptStatus,
        source_url: Option<&str>,
        event_date: Option<DateTime<Utc>>,
        origin: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO transcript_events
                 (equity_id, quarter, year, status, source_url, event_date, origin, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                equity_id,
                slot.quarter.as_str(),
                slot.year,
                status.as_str(),
                source_url,
                event_date.map(ts),
                origin,
                ts(now)
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn set_content_path(&self, transcript_id: i64, path: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE transcripts SET content_path = ?1, updated_at = ?2 WHERE id = ?3",
            params![path, ts(now), transcript_id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Analysis reservation (at-most-one in flight per transcript)
    // =========================================================================

    /// Compare-and-set `analysis_status` to `in_progress`. Succeeds only
    /// from the unreserved states; a concurrent holder makes this return
    /// `false`.
    pub fn try_reserve_analysis(&self, transcript_id: i64, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let updated = self.conn().execute(
            "UPDATE transcripts
             SET analysis_status = 'in_progress', analysis_error = NULL, updated_at = ?1
             WHERE id = ?2
               AND (analysis_status IS NULL OR analysis_status IN ('error', 'done'))",
            params![ts(now), transcript_id],
        )?;
        Ok(updated > 0)
    }

    /// Release a reservation without a verdict (transient failure; the
    /// retry will re-reserve).
    pub fn release_analysis_reservation(&self, transcript_id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE transcripts
             SET analysis_status = NULL, updated_at = ?1
             WHERE id = ?2 AND analysis_status = 'in_progress'",
            params![ts(now), transcript_id],
        )?;
        Ok(())
    }

    pub fn mark_analysis_done(&self, transcript_id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE transcripts
             SET analysis_status = 'done', analysis_error = NULL, updated_at = ?1
             WHERE id = ?2",
            params![ts(now), transcript_id],
        )?;
        Ok(())
    }

    pub fn mark_analysis_error(
        &self,
        transcript_id: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut truncated = error.to_string();
        truncated.truncate(500);
        self.conn().execute(
            "UPDATE transcripts
             SET analysis_status = 'error', analysis_error = ?1, updated_at = ?2
             WHERE id = ?3",
            params![truncated, ts(now), transcript_id],
        )?;
        Ok(())
    }

    /// Transcript ids stuck `in_progress` since before `cutoff` (crashed
    /// holder; the lease lapsed with no verdict).
    pub fn stale_analysis_reservations(&self, cutoff: DateTime<Utc>) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id FROM transcripts
             WHERE analysis_status = 'in_progress' AND updated_at < ?1
             ORDER BY id",
        )?;
        let ids = stmt
            .query_map(params![ts(cutoff)], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }
}
