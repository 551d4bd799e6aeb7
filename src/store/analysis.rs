//! Analysis jobs and completed analyses.
//!
//! Jobs are the durable record of analysis work; the idempotency key
//! collapses duplicate enqueues. Job retry state lives here; the queue
//! message is just the wake-up call.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

use super::types::{AnalysisJob, JobStatus, TranscriptAnalysis};
use super::{Store, StoreError};
use crate::clock::{parse_ts, ts};
use crate::idempotency::analysis_key;

/// Lease on an in-progress analysis job. Generous: a slow provider call
/// plus a download must fit inside it.
pub const ANALYSIS_JOB_LEASE: Duration = Duration::minutes(15);

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalysisJob> {
    let status: String = row.get(2)?;
    let retry_next_at: Option<String> = row.get(7)?;
    let locked_until: Option<String> = row.get(8)?;
    Ok(AnalysisJob {
        id: row.get(0)?,
        transcript_id: row.get(1)?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
        attempts: row.get(3)?,
        idempotency_key: row.get(4)?,
        force: row.get::<_, i64>(5)? != 0,
        last_error: row.get(6)?,
        retry_next_at: retry_next_at.as_deref().and_then(parse_ts),
        locked_until: locked_until.as_deref().and_then(parse_ts),
    })
}

const JOB_COLS: &str = "id, transcript_id, status, attempts, idempotency_key, force, last_error, \
                        retry_next_at, locked_until";

fn analysis_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TranscriptAnalysis> {
    let created_at: String = row.get(10)?;
    Ok(TranscriptAnalysis {
        id: row.get(0)?,
        transcript_id: row.get(1)?,
        prompt_snapshot: row.get(2)?,
        output_text: row.get(3)?,
        model_provider: row.get(4)?,
        model_id: row.get(5)?,
        model_revision: row.get(6)?,
        tokens_in: row.get(7)?,
        tokens_out: row.get(8)?,
        cost: row.get(9)?,
        created_at: parse_ts(&created_at).unwrap_or_default(),
    })
}

const ANALYSIS_COLS: &str = "id, transcript_id, prompt_snapshot, output_text, model_provider, \
                             model_id, model_revision, tokens_in, tokens_out, cost, created_at";

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job was created.
    Created(AnalysisJob),
    /// An equivalent job already exists and is still live.
    Existing(AnalysisJob),
    /// The work is already done (or the transcript is not analysable) and
    /// no job was created.
    Skipped,
}

impl EnqueueOutcome {
    pub fn job(&self) -> Option<&AnalysisJob> {
        match self {
            EnqueueOutcome::Created(job) | EnqueueOutcome::Existing(job) => Some(job),
            EnqueueOutcome::Skipped => None,
        }
    }
}

impl Store {
    /// Create (or find) the analysis job for a transcript.
    ///
    /// Without `force`, an existing completed analysis short-circuits to
    /// `Skipped`, and a live job with the same key is returned as
    /// `Existing`. With `force`, a fresh key is derived from the count of
    /// prior jobs so every operator rerun gets its own row.
    pub fn enqueue_analysis_job(
        &self,
        transcript_id: i64,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        let source_url: Option<String> = tx
            .query_row(
                "SELECT source_url FROM transcripts WHERE id = ?1",
                params![transcript_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let Some(source_url) = source_url else {
            tx.commit()?;
            return Ok(EnqueueOutcome::Skipped);
        };

        if !force {
            let analysed: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM transcript_analyses WHERE transcript_id = ?1 LIMIT 1",
                    params![transcript_id],
                    |row| row.get(0),
                )
                .optional()?;
            if analysed.is_some() {
                tx.commit()?;
                return Ok(EnqueueOutcome::Skipped);
            }
        }

        let generation: i64 = if force {
            tx.query_row(
                "SELECT COUNT(*) FROM analysis_jobs WHERE transcript_id = ?1",
                params![transcript_id],
                |row| row.get(0),
            )?
        } else {
            0
        };
        let key = analysis_key(transcript_id, &source_url, generation);

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO analysis_jobs
                 (transcript_id, status, attempts, idempotency_key, force, created_at, updated_at)
             VALUES (?1, 'pending', 0, ?2, ?3, ?4, ?4)",
            params![transcript_id, key, force as i64, ts(now)],
        )?;

        let job = tx
            .query_row(
                &format!(
                    "SELECT {} FROM analysis_jobs WHERE idempotency_key = ?1",
                    JOB_COLS
                ),
                params![key],
                job_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("analysis job {}", key)))?;
        tx.commit()?;

        if inserted > 0 {
            return Ok(EnqueueOutcome::Created(job));
        }
        if job.status == JobStatus::Done && !force {
            return Ok(EnqueueOutcome::Skipped);
        }
        Ok(EnqueueOutcome::Existing(job))
    }

    pub fn get_analysis_job(&self, id: i64) -> Result<Option<AnalysisJob>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM analysis_jobs WHERE id = ?1", JOB_COLS),
                params![id],
                job_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Move a job into `in_progress` under a fresh lease. Returns the job,
    /// or `None` when it is already terminal (nothing to do).
    pub fn begin_analysis_job(
        &self,
        job_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<AnalysisJob>, StoreError> {
        let updated = self.conn().execute(
            "UPDATE analysis_jobs
             SET status = 'in_progress', locked_until = ?1, updated_at = ?2
             WHERE id = ?3 AND status IN ('pending', 'in_progress')",
            params![ts(now + ANALYSIS_JOB_LEASE), ts(now), job_id],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_analysis_job(job_id)
    }

    pub fn complete_analysis_job(&self, job_id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE analysis_jobs
             SET status = 'done', last_error = NULL, retry_next_at = NULL, locked_until = NULL,
                 updated_at = ?1
             WHERE id = ?2",
            params![ts(now), job_id],
        )?;
        Ok(())
    }

    /// Transient failure: bump attempts, schedule the retry, release the
    /// lock. Returns the new attempt count.
    pub fn retry_analysis_job(
        &self,
        job_id: i64,
        retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.conn().execute(
            "UPDATE analysis_jobs
             SET status = 'pending', attempts = attempts + 1, retry_next_at = ?1,
                 last_error = ?2, locked_until = NULL, updated_at = ?3
             WHERE id = ?4",
            params![ts(retry_at), error, ts(now), job_id],
        )?;
        let attempts = self.conn().query_row(
            "SELECT attempts FROM analysis_jobs WHERE id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    pub fn fail_analysis_job(
        &self,
        job_id: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE analysis_jobs
             SET status = 'error', last_error = ?1, retry_next_at = NULL, locked_until = NULL,
                 updated_at = ?2
             WHERE id = ?3",
            params![error, ts(now), job_id],
        )?;
        Ok(())
    }

    /// Attempts exhausted: poison the job.
    pub fn kill_analysis_job(
        &self,
        job_id: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE analysis_jobs
             SET status = 'dead', last_error = ?1, retry_next_at = NULL, locked_until = NULL,
                 updated_at = ?2
             WHERE id = ?3",
            params![error, ts(now), job_id],
        )?;
        Ok(())
    }

    /// Pending jobs whose retry time has arrived and whose lock has
    /// lapsed: the reconciliation sweep re-publishes these. Each returned
    /// job is re-leased so back-to-back sweeps do not double-publish.
    pub fn claim_due_analysis_jobs(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<AnalysisJob>, StoreError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let jobs = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM analysis_jobs
                 WHERE status = 'pending'
                   AND (retry_next_at IS NULL OR retry_next_at <= ?1)
                   AND (locked_until IS NULL OR locked_until < ?1)
                 ORDER BY id ASC
                 LIMIT ?2",
                JOB_COLS
            ))?;
            let rows = stmt
                .query_map(params![ts(now), limit as i64], job_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let lock = ts(now + ANALYSIS_JOB_LEASE);
        for job in &jobs {
            tx.execute(
                "UPDATE analysis_jobs SET locked_until = ?1, updated_at = ?2 WHERE id = ?3",
                params![lock, ts(now), job.id],
            )?;
        }
        tx.commit()?;
        Ok(jobs)
    }

    /// Crash recovery: jobs stuck `in_progress` past their lease go back
    /// to `pending`, retryable immediately.
    pub fn recover_expired_analysis_jobs(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let recovered = self.conn().execute(
            "UPDATE analysis_jobs
             SET status = 'pending', retry_next_at = ?1, locked_until = NULL, updated_at = ?1
             WHERE status = 'in_progress'
               AND (locked_until IS NULL OR locked_until < ?1)",
            params![ts(now)],
        )?;
        Ok(recovered)
    }

    // =========================================================================
    // Analyses
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    pub fn insert_analysis(
        &self,
        transcript_id: i64,
        prompt_snapshot: &str,
        output_text: &str,
        model_provider: &str,
        model_id: &str,
        model_revision: Option<&str>,
        tokens_in: i64,
        tokens_out: i64,
        cost: f64,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO transcript_analyses
                 (transcript_id, prompt_snapshot, output_text, model_provider, model_id,
                  model_revision, tokens_in, tokens_out, cost, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                transcript_id,
                prompt_snapshot,
                output_text,
                model_provider,
                model_id,
                model_revision,
                tokens_in,
                tokens_out,
                cost,
                ts(now)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_analysis(&self, id: i64) -> Result<Option<TranscriptAnalysis>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM transcript_analyses WHERE id = ?1", ANALYSIS_COLS),
                params![id],
                analysis_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn latest_analysis_for(
        &self,
        transcript_id: i64,
    ) -> Result<Option<TranscriptAnalysis>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM transcript_analyses
                     WHERE transcript_id = ?1 ORDER BY id DESC LIMIT 1",
                    ANALYSIS_COLS
                ),
                params![transcript_id],
                analysis_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn count_analyses_for(&self, transcript_id: i64) -> Result<i64, StoreError> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM transcript_analyses WHERE transcript_id = ?1",
            params![transcript_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
