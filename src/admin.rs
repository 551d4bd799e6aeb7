//! Administrative surface: the typed contract the UI layer mounts.
//!
//! HTTP routing and rendering live outside the core; these functions are
//! the operations behind `GET /scheduler/status`, `POST /scheduler/trigger`,
//! `POST /analyze/{equity_id}`, and `POST /groups/{id}/articles`. Every
//! operation is a command on durable state, so it works identically from
//! any process attached to the same database.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::OptionalExtension;
use serde::Serialize;
use thiserror::Error;

use crate::clock::parse_ts;
use crate::fiscal::{target_quarter, Quarter, QuarterYear};
use crate::queue::{AnalysisRequestMsg, GroupResearchMsg, QueueName};
use crate::scheduler::{SchedulerState, TICK_INTERVAL_SECS};
use crate::store::schedule::{PRIORITY_GROUP, PRIORITY_WATCHLIST};
use crate::store::types::AnalysisJob;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Shape of `GET /scheduler/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub scheduler_running: bool,
    pub is_polling: bool,
    pub poll_interval_seconds: u64,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub next_poll_in_seconds: Option<i64>,
}

pub fn scheduler_status(
    store: &Store,
    state: &Arc<SchedulerState>,
    now: DateTime<Utc>,
) -> Result<SchedulerStatus, AdminError> {
    // The earliest unlocked due time across the schedule is the next poll.
    let next_poll_at: Option<String> = store
        .conn()
        .query_row(
            "SELECT MIN(next_check_at) FROM fetch_schedule WHERE next_check_at IS NOT NULL",
            [],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    let next_poll_at = next_poll_at.as_deref().and_then(parse_ts);

    Ok(SchedulerStatus {
        scheduler_running: state.is_running(),
        is_polling: state.is_polling(),
        poll_interval_seconds: TICK_INTERVAL_SECS,
        next_poll_at,
        next_poll_in_seconds: next_poll_at.map(|at| (at - now).num_seconds().max(0)),
    })
}

/// Outcome of `POST /scheduler/trigger`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// A tick was enqueued; the scheduler will dispatch within a tick.
    Triggered,
    /// A dispatch pass is already running (HTTP 202 upstream).
    AlreadyPolling,
}

pub fn trigger_dispatch(
    store: &Store,
    state: &Arc<SchedulerState>,
    now: DateTime<Utc>,
) -> Result<TriggerOutcome, AdminError> {
    if state.is_polling() {
        return Ok(TriggerOutcome::AlreadyPolling);
    }
    store.publish(
        QueueName::SchedulerTick,
        &serde_json::json!({ "origin": "admin" }),
        Duration::zero(),
        now,
    )?;
    Ok(TriggerOutcome::Triggered)
}

/// `POST /analyze/{equity_id}`: create an analysis job for the equity's
/// transcript in the given (or current target) quarter and publish its
/// request. Returns the job, or `None` when the work is already done and
/// `force` was not set.
pub fn force_analysis(
    store: &Store,
    equity_id: i64,
    force: bool,
    quarter: Option<Quarter>,
    year: Option<i32>,
    now: DateTime<Utc>,
) -> Result<Option<AnalysisJob>, AdminError> {
    let slot = match (quarter, year) {
        (Some(quarter), Some(year)) => QuarterYear::new(quarter, year),
        _ => target_quarter(now),
    };

    let Some(transcript) = store.get_transcript_for_slot(equity_id, slot)? else {
        // No transcript yet: reset the schedule row so the next tick
        // polls immediately, and report the miss.
        let priority = if store.is_on_watchlist(equity_id)? {
            PRIORITY_WATCHLIST
        } else {
            PRIORITY_GROUP
        };
        store.trigger_schedule_now(equity_id, slot, priority, now)?;
        return Err(AdminError::NotFound(format!(
            "no transcript for equity {} in {}; check scheduled",
            equity_id, slot
        )));
    };

    let outcome = store.enqueue_analysis_job(transcript.id, force, now)?;
    let Some(job) = outcome.job().cloned() else {
        return Ok(None);
    };

    let Some(source_url) = transcript.source_url else {
        return Err(AdminError::NotFound(format!(
            "transcript {} has no source URL",
            transcript.id
        )));
    };
    store.publish(
        QueueName::AnalysisRequest,
        &AnalysisRequestMsg {
            job_id: job.id,
            transcript_id: transcript.id,
            source_url,
            force,
        },
        Duration::zero(),
        now,
    )?;
    Ok(Some(job))
}

/// `POST /groups/{id}/articles`: create or re-open the research run for
/// the slot with `force=true` (fan-in bypassed, missing members skipped).
/// Returns the run id.
pub fn force_group_article(
    store: &Store,
    group_id: i64,
    slot: QuarterYear,
    now: DateTime<Utc>,
) -> Result<i64, AdminError> {
    if store.get_group(group_id)?.is_none() {
        return Err(AdminError::NotFound(format!("group {}", group_id)));
    }
    let run_id = store.reopen_run_pending(group_id, slot, now)?;
    store.publish(
        QueueName::GroupResearch,
        &GroupResearchMsg::Run {
            group_id,
            quarter: slot.quarter,
            year: slot.year,
            force: true,
        },
        Duration::zero(),
        now,
    )?;
    Ok(run_id)
}

/// Immediate re-check for one equity (used right after a watchlist or
/// group insertion): the schedule row is created or reset to fire on the
/// next tick.
pub fn trigger_equity_check(
    store: &Store,
    equity_id: i64,
    slot: Option<QuarterYear>,
    now: DateTime<Utc>,
) -> Result<(), AdminError> {
    if store.get_equity(equity_id)?.is_none() {
        return Err(AdminError::NotFound(format!("equity {}", equity_id)));
    }
    let slot = slot.unwrap_or_else(|| target_quarter(now));
    let priority = if store.is_on_watchlist(equity_id)? {
        PRIORITY_WATCHLIST
    } else {
        PRIORITY_GROUP
    };
    store.trigger_schedule_now(equity_id, slot, priority, now)?;
    Ok(())
}
