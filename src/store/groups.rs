//! Groups, memberships, and group research runs.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::types::{Equity, Group, GroupResearchRun, RunStatus};
use super::{Store, StoreError};
use crate::clock::ts;
use crate::fiscal::{Quarter, QuarterYear};

fn group_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        deep_research_prompt: row.get(2)?,
        stock_summary_prompt: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
    })
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupResearchRun> {
    let quarter: String = row.get(2)?;
    let status: String = row.get(4)?;
    Ok(GroupResearchRun {
        id: row.get(0)?,
        group_id: row.get(1)?,
        quarter: quarter.parse::<Quarter>().unwrap_or(Quarter::Q1),
        year: row.get(3)?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Pending),
        prompt_snapshot: row.get(5)?,
        output_text: row.get(6)?,
        model_provider: row.get(7)?,
        model_id: row.get(8)?,
        model_revision: row.get(9)?,
        error_message: row.get(10)?,
    })
}

const GROUP_COLS: &str = "id, name, deep_research_prompt, stock_summary_prompt, is_active";
const RUN_COLS: &str = "id, group_id, quarter, year, status, prompt_snapshot, output_text, \
                        model_provider, model_id, model_revision, error_message";

impl Store {
    pub fn insert_group(
        &self,
        name: &str,
        deep_research_prompt: Option<&str>,
        stock_summary_prompt: Option<&str>,
        is_active: bool,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO groups (name, deep_research_prompt, stock_summary_prompt, is_active,
                                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                name,
                deep_research_prompt,
                stock_summary_prompt,
                is_active as i64,
                ts(now)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_group(&self, id: i64) -> Result<Option<Group>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM groups WHERE id = ?1", GROUP_COLS),
                params![id],
                group_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn set_group_active(&self, id: i64, is_active: bool, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE groups SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
            params![is_active as i64, ts(now), id],
        )?;
        Ok(())
    }

    pub fn add_group_member(
        &self,
        group_id: i64,
        equity_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO group_memberships (group_id, equity_id, added_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(group_id, equity_id) DO UPDATE SET updated_at = excluded.updated_at",
            params![group_id, equity_id, ts(now)],
        )?;
        Ok(())
    }

    pub fn remove_group_member(&self, group_id: i64, equity_id: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM group_memberships WHERE group_id = ?1 AND equity_id = ?2",
            params![group_id, equity_id],
        )?;
        Ok(())
    }

    /// Active groups containing the given equity.
    pub fn active_groups_for_equity(&self, equity_id: i64) -> Result<Vec<Group>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT g.id, g.name, g.deep_research_prompt, g.stock_summary_prompt, g.is_active
             FROM groups g
             JOIN group_memberships gm ON gm.group_id = g.id
             WHERE gm.equity_id = ?1 AND g.is_active = 1
             ORDER BY g.id",
        )?;
        let groups = stmt
            .query_map(params![equity_id], group_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    /// Whether the equity belongs to at least one active group.
    pub fn in_active_group(&self, equity_id: i64) -> Result<bool, StoreError> {
        Ok(!self.active_groups_for_equity(equity_id)?.is_empty())
    }

    /// Current members of a group.
    pub fn group_members(&self, group_id: i64) -> Result<Vec<Equity>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.symbol, e.alt_code, e.identifier, e.name
             FROM equities e
             JOIN group_memberships gm ON gm.equity_id = e.id
             WHERE gm.group_id = ?1
             ORDER BY e.id",
        )?;
        let members = stmt
            .query_map(params![group_id], |row| {
                Ok(Equity {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    alt_code: row.get(2)?,
                    identifier: row.get(3)?,
                    name: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(members)
    }

    /// Group-level analysis prompt override for an equity: the
    /// `stock_summary_prompt` of the first active group that sets one.
    pub fn stock_summary_prompt_for(&self, equity_id: i64) -> Result<Option<String>, StoreError> {
        let prompt: Option<String> = self
            .conn()
            .query_row(
                "SELECT g.stock_summary_prompt
                 FROM groups g
                 JOIN group_memberships gm ON gm.group_id = g.id
                 WHERE gm.equity_id = ?1 AND g.is_active = 1
                   AND g.stock_summary_prompt IS NOT NULL AND g.stock_summary_prompt != ''
                 ORDER BY g.id LIMIT 1",
                params![equity_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(prompt)
    }

    // =========================================================================
    // Fan-in readiness
    // =========================================================================

    /// Member equity ids lacking an available transcript for the slot.
    pub fn members_missing_transcript(
        &self,
        group_id: i64,
        slot: QuarterYear,
    ) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT gm.equity_id
             FROM group_memberships gm
             WHERE gm.group_id = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM transcripts t
                   WHERE t.equity_id = gm.equity_id
                     AND t.quarter = ?2 AND t.year = ?3
                     AND t.status = 'available'
               )
             ORDER BY gm.equity_id",
        )?;
        let ids = stmt
            .query_map(params![group_id, slot.quarter.as_str(), slot.year], |row| {
                row.get(0)
            })?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Member equity ids lacking a completed analysis for the slot. A
    /// member missing the transcript entirely is also returned here.
    pub fn members_missing_analysis(
        &self,
        group_id: i64,
        slot: QuarterYear,
    ) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT gm.equity_id
             FROM group_memberships gm
             WHERE gm.group_id = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM transcripts t
                   JOIN transcript_analyses ta ON ta.transcript_id = t.id
                   WHERE t.equity_id = gm.equity_id
                     AND t.quarter = ?2 AND t.year = ?3
                     AND t.status = 'available'
               )
             ORDER BY gm.equity_id",
        )?;
        let ids = stmt
            .query_map(params![group_id, slot.quarter.as_str(), slot.year], |row| {
                row.get(0)
            })?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Slots for which every current member has an available transcript —
    /// the candidate set for the periodic fan-in sweep.
    pub fn group_ready_slots(&self, group_id: i64) -> Result<Vec<QuarterYear>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.quarter, t.year
             FROM transcripts t
             JOIN group_memberships gm
               ON gm.equity_id = t.equity_id AND gm.group_id = ?1
             WHERE t.status = 'available'
             GROUP BY t.quarter, t.year
             HAVING COUNT(DISTINCT t.equity_id) =
                    (SELECT COUNT(*) FROM group_memberships WHERE group_id = ?1)
             ORDER BY t.year DESC, t.quarter DESC",
        )?;
        let slots = stmt
            .query_map(params![group_id], |row| {
                let quarter: String = row.get(0)?;
                let year: i32 = row.get(1)?;
                Ok((quarter, year))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|(q, year)| {
                q.parse::<Quarter>()
                    .ok()
                    .map(|quarter| QuarterYear { quarter, year })
            })
            .collect();
        Ok(slots)
    }

    // =========================================================================
    // Research runs
    // =========================================================================

    pub fn get_run(&self, id: i64) -> Result<Option<GroupResearchRun>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM group_research_runs WHERE id = ?1", RUN_COLS),
                params![id],
                run_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_run_for_slot(
        &self,
        group_id: i64,
        slot: QuarterYear,
    ) -> Result<Option<GroupResearchRun>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM group_research_runs
                     WHERE group_id = ?1 AND quarter = ?2 AND year = ?3",
                    RUN_COLS
                ),
                params![group_id, slot.quarter.as_str(), slot.year],
                run_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Insert a `pending` run for the slot if none exists. Returns the run
    /// id and whether this call created it.
    pub fn insert_run_pending(
        &self,
        group_id: i64,
        slot: QuarterYear,
        now: DateTime<Utc>,
    ) -> Result<(i64, bool), StoreError> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO group_research_runs
                 (group_id, quarter, year, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
            params![group_id, slot.quarter.as_str(), slot.year, ts(now)],
        )?;
        let run = self
            .get_run_for_slot(group_id, slot)?
            .ok_or_else(|| StoreError::NotFound(format!("run for group {}", group_id)))?;
        Ok((run.id, inserted > 0))
    }

    /// Force path: create the run or re-open an existing one to `pending`,
    /// whatever state it was in.
    pub fn reopen_run_pending(
        &self,
        group_id: i64,
        slot: QuarterYear,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.conn().execute(
            "INSERT INTO group_research_runs
                 (group_id, quarter, year, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)
             ON CONFLICT(group_id, quarter, year) DO UPDATE SET
                 status = 'pending',
                 error_message = NULL,
                 updated_at = excluded.updated_at",
            params![group_id, slot.quarter.as_str(), slot.year, ts(now)],
        )?;
        let run = self
            .get_run_for_slot(group_id, slot)?
            .ok_or_else(|| StoreError::NotFound(format!("run for group {}", group_id)))?;
        Ok(run.id)
    }

    /// Atomically transition `pending -> in_progress`. With `force`, any
    /// non-in-progress state may be (re-)claimed.
    pub fn claim_run(&self, run_id: i64, force: bool, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let updated = if force {
            self.conn().execute(
                "UPDATE group_research_runs
                 SET status = 'in_progress', error_message = NULL, updated_at = ?1
                 WHERE id = ?2 AND status != 'in_progress'",
                params![ts(now), run_id],
            )?
        } else {
            self.conn().execute(
                "UPDATE group_research_runs
                 SET status = 'in_progress', error_message = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![ts(now), run_id],
            )?
        };
        Ok(updated > 0)
    }

    pub fn complete_run(
        &self,
        run_id: i64,
        prompt_snapshot: &str,
        output_text: &str,
        model_provider: &str,
        model_id: &str,
        model_revision: Option<&str>,
        skipped_members: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE group_research_runs
             SET status = 'done', prompt_snapshot = ?1, output_text = ?2,
                 model_provider = ?3, model_id = ?4, model_revision = ?5,
                 error_message = ?6, updated_at = ?7
             WHERE id = ?8",
            params![
                prompt_snapshot,
                output_text,
                model_provider,
                model_id,
                model_revision,
                skipped_members,
                ts(now),
                run_id
            ],
        )?;
        Ok(())
    }

    pub fn fail_run(&self, run_id: i64, error: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE group_research_runs
             SET status = 'error', error_message = ?1, updated_at = ?2
             WHERE id = ?3",
            params![error, ts(now), run_id],
        )?;
        Ok(())
    }

    /// Put an in-progress run back to `pending` (transient failure path).
    pub fn release_run(&self, run_id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE group_research_runs
             SET status = 'pending', updated_at = ?1
             WHERE id = ?2 AND status = 'in_progress'",
            params![ts(now), run_id],
        )?;
        Ok(())
    }

    /// Pending runs untouched since `cutoff` — their dispatch message was
    /// lost; the sweep re-publishes them.
    pub fn stale_pending_runs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<GroupResearchRun>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM group_research_runs
             WHERE status = 'pending' AND updated_at < ?1
             ORDER BY id",
            RUN_COLS
        ))?;
        let runs = stmt
            .query_map(params![ts(cutoff)], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Active groups with a configured deep-research prompt (the sweep's
    /// candidate set).
    pub fn active_research_groups(&self) -> Result<Vec<Group>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM groups
             WHERE is_active = 1
               AND deep_research_prompt IS NOT NULL AND deep_research_prompt != ''
             ORDER BY id",
            GROUP_COLS
        ))?;
        let groups = stmt
            .query_map([], group_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(groups)
    }
}
