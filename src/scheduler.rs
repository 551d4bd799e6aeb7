//! The scheduler: schedule-table maintenance and dispatch.
//!
//! One task per process. Every tick it claims due schedule rows and turns
//! them into `transcript_check` messages; once a minute it re-syncs the
//! schedule against the watchlist and active groups (which is also where
//! quarter-window advancement happens — a new target quarter simply means
//! new rows on the next sync). The scheduler never calls the oracle.
//!
//! An operator trigger arrives as a zero-delay `scheduler_tick` message
//! rather than a poke at this object, so a trigger survives a restart and
//! works from any process.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use crate::clock::Clock;
use crate::fiscal::{target_quarter, QuarterYear};
use crate::queue::{AnalysisRequestMsg, QueueName, TranscriptCheckMsg};
use crate::retry::{jittered, schedule_backoff, uniform_between};
use crate::store::schedule::{PRIORITY_GROUP, PRIORITY_WATCHLIST};
use crate::store::types::TranscriptStatus;
use crate::store::Store;

/// Dispatch tick.
pub const TICK_INTERVAL_SECS: u64 = 1;

/// Schedule re-sync cadence.
const SYNC_INTERVAL: Duration = Duration::seconds(60);

/// Rows claimed per dispatch pass.
const DISPATCH_BATCH: usize = 100;

/// Retry-due analysis jobs re-published per pass.
const JOB_SWEEP_BATCH: usize = 100;

// ---------------------------------------------------------------------------
// Cadence
// ---------------------------------------------------------------------------

/// Compute the next poll time for a schedule row after a successful check,
/// from the observed status and (for upcoming calls) the event date.
pub fn next_check_after(
    status: TranscriptStatus,
    event_date: Option<DateTime<Utc>>,
    slot: QuarterYear,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let delta = match status {
        // Keep the row warm for follow-ups within the quarter.
        TranscriptStatus::Available => jittered(Duration::hours(24)),
        TranscriptStatus::Upcoming => match event_date {
            Some(event) => {
                let until_event = event - now;
                if until_event <= Duration::hours(24) {
                    jittered(Duration::minutes(10))
                } else if until_event <= Duration::days(7) {
                    jittered(Duration::minutes(60))
                } else {
                    jittered(Duration::hours(4))
                }
            }
            None => jittered(Duration::hours(4)),
        },
        TranscriptStatus::None => {
            if slot == target_quarter(now) {
                uniform_between(Duration::hours(4), Duration::hours(6))
            } else {
                jittered(Duration::hours(24))
            }
        }
    };
    now + delta
}

/// Next poll time after the `attempts`-th consecutive transient error.
pub fn next_check_after_error(attempts: i64, now: DateTime<Utc>) -> DateTime<Utc> {
    now + schedule_backoff(attempts.max(0) as u32)
}

// ---------------------------------------------------------------------------
// Shared status (read by the admin surface)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct StateInner {
    running: bool,
    polling: bool,
    last_dispatch_at: Option<DateTime<Utc>>,
}

/// Live scheduler state, shared with the admin surface.
#[derive(Debug, Default)]
pub struct SchedulerState {
    inner: Mutex<StateInner>,
}

impl SchedulerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set_running(&self, running: bool) {
        self.inner.lock().expect("state lock").running = running;
    }

    fn set_polling(&self, polling: bool, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("state lock");
        inner.polling = polling;
        if polling {
            inner.last_dispatch_at = Some(now);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().expect("state lock").running
    }

    pub fn is_polling(&self) -> bool {
        self.inner.lock().expect("state lock").polling
    }

    pub fn last_dispatch_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().expect("state lock").last_dispatch_at
    }
}

// ---------------------------------------------------------------------------
// Scheduler task
// ---------------------------------------------------------------------------

pub struct Scheduler {
    store: Store,
    clock: Arc<dyn Clock>,
    state: Arc<SchedulerState>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        state: Arc<SchedulerState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            clock,
            state,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        log::info!("Scheduler: started");
        self.state.set_running(true);

        let mut next_sync = self.clock.now();

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_secs(TICK_INTERVAL_SECS)).await;

            let now = self.clock.now();

            // Operator triggers force an immediate full pass.
            let forced = match drain_trigger_messages(&self.store, now) {
                Ok(forced) => forced,
                Err(e) => {
                    log::warn!("Scheduler: trigger drain failed: {}", e);
                    false
                }
            };

            if forced || now >= next_sync {
                match sync_schedule(&self.store, now) {
                    Ok(summary) => {
                        if summary.rows_deleted > 0 || summary.rows_retired > 0 {
                            log::info!(
                                "Scheduler: sync for {} removed {} untracked rows, retired {}",
                                summary.target,
                                summary.rows_deleted,
                                summary.rows_retired
                            );
                        }
                    }
                    Err(e) => log::warn!("Scheduler: schedule sync failed: {}", e),
                }
                next_sync = now + SYNC_INTERVAL;
            }

            self.state.set_polling(true, now);
            match dispatch_due(&self.store, now) {
                Ok(published) if published > 0 => {
                    log::debug!("Scheduler: dispatched {} transcript checks", published);
                }
                Ok(_) => {}
                Err(e) => log::warn!("Scheduler: dispatch failed: {}", e),
            }
            if let Err(e) = sweep_due_analysis_jobs(&self.store, now) {
                log::warn!("Scheduler: analysis job sweep failed: {}", e);
            }
            self.state.set_polling(false, now);
        }

        self.state.set_running(false);
        log::info!("Scheduler: stopped");
    }
}

/// Claim and ack any pending `scheduler_tick` messages. Returns whether at
/// least one was seen.
pub fn drain_trigger_messages(store: &Store, now: DateTime<Utc>) -> Result<bool, String> {
    let ticks = store
        .claim(QueueName::SchedulerTick, 10, now)
        .map_err(|e| e.to_string())?;
    let forced = !ticks.is_empty();
    for tick in ticks {
        store.ack(tick.id).map_err(|e| e.to_string())?;
    }
    Ok(forced)
}

#[derive(Debug)]
pub struct SyncSummary {
    pub target: QuarterYear,
    pub rows_deleted: usize,
    pub rows_retired: usize,
}

/// Reconcile the schedule with the tracked sets: one row per tracked
/// equity for the target quarter (watchlist lane above group lane), rows
/// for departed equities dropped, long-quiet old-quarter rows retired.
pub fn sync_schedule(store: &Store, now: DateTime<Utc>) -> Result<SyncSummary, String> {
    let target = target_quarter(now);

    let watchlist = store.watchlist_equity_ids().map_err(|e| e.to_string())?;
    let grouped = store.active_group_equity_ids().map_err(|e| e.to_string())?;

    for &equity_id in &watchlist {
        store
            .ensure_schedule_row(equity_id, target, PRIORITY_WATCHLIST, now)
            .map_err(|e| e.to_string())?;
    }
    for &equity_id in &grouped {
        if !watchlist.contains(&equity_id) {
            store
                .ensure_schedule_row(equity_id, target, PRIORITY_GROUP, now)
                .map_err(|e| e.to_string())?;
        }
    }

    let mut tracked = watchlist;
    for id in grouped {
        if !tracked.contains(&id) {
            tracked.push(id);
        }
    }
    let rows_deleted = store
        .delete_untracked_schedule_rows(&tracked)
        .map_err(|e| e.to_string())?;
    let rows_retired = store
        .retire_stale_schedule_rows(target, now)
        .map_err(|e| e.to_string())?;

    Ok(SyncSummary {
        target,
        rows_deleted,
        rows_retired,
    })
}

/// Claim due schedule rows and publish one `transcript_check` each.
pub fn dispatch_due(store: &Store, now: DateTime<Utc>) -> Result<usize, String> {
    let rows = store
        .claim_due_schedule(DISPATCH_BATCH, now)
        .map_err(|e| e.to_string())?;
    for row in &rows {
        let msg = TranscriptCheckMsg {
            schedule_id: row.id,
            equity_id: row.equity_id,
            quarter: row.quarter,
            year: row.year,
        };
        store
            .publish(QueueName::TranscriptCheck, &msg, Duration::zero(), now)
            .map_err(|e| e.to_string())?;
    }
    Ok(rows.len())
}

/// Re-publish `analysis_request` for jobs whose retry time has arrived.
/// This is the belt-and-braces path: a lost direct publish only ever
/// costs one sweep interval.
pub fn sweep_due_analysis_jobs(store: &Store, now: DateTime<Utc>) -> Result<usize, String> {
    let jobs = store
        .claim_due_analysis_jobs(JOB_SWEEP_BATCH, now)
        .map_err(|e| e.to_string())?;
    let mut published = 0;
    for job in jobs {
        let transcript = store
            .get_transcript(job.transcript_id)
            .map_err(|e| e.to_string())?;
        let Some(transcript) = transcript else {
            store
                .fail_analysis_job(job.id, "transcript row disappeared", now)
                .map_err(|e| e.to_string())?;
            continue;
        };
        let Some(source_url) = transcript.source_url else {
            store
                .fail_analysis_job(job.id, "transcript has no source URL", now)
                .map_err(|e| e.to_string())?;
            continue;
        };
        let msg = AnalysisRequestMsg {
            job_id: job.id,
            transcript_id: job.transcript_id,
            source_url,
            force: job.force,
        };
        store
            .publish(QueueName::AnalysisRequest, &msg, Duration::zero(), now)
            .map_err(|e| e.to_string())?;
        published += 1;
    }
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiscal::Quarter;
    use crate::store::test_support::{seed_equity, store, t0};

    fn target() -> QuarterYear {
        // t0 is 2026-01-10, inside Q4 FY26: the target is Q3 FY26.
        QuarterYear::new(Quarter::Q3, 2026)
    }

    // -- cadence ------------------------------------------------------------

    fn assert_delta_within(next: DateTime<Utc>, base: Duration) {
        let delta = next - t0();
        assert!(delta >= base, "delta {} below {}", delta, base);
        assert!(
            delta <= base + Duration::milliseconds(base.num_milliseconds() / 5),
            "delta {} above jitter bound of {}",
            delta,
            base
        );
    }

    #[test]
    fn test_cadence_available() {
        let next = next_check_after(TranscriptStatus::Available, None, target(), t0());
        assert_delta_within(next, Duration::hours(24));
    }

    #[test]
    fn test_cadence_upcoming_tiers() {
        let soon = t0() + Duration::minutes(30);
        let next = next_check_after(TranscriptStatus::Upcoming, Some(soon), target(), t0());
        assert_delta_within(next, Duration::minutes(10));

        let this_week = t0() + Duration::days(3);
        let next = next_check_after(TranscriptStatus::Upcoming, Some(this_week), target(), t0());
        assert_delta_within(next, Duration::minutes(60));

        let far = t0() + Duration::days(20);
        let next = next_check_after(TranscriptStatus::Upcoming, Some(far), target(), t0());
        assert_delta_within(next, Duration::hours(4));

        let next = next_check_after(TranscriptStatus::Upcoming, None, target(), t0());
        assert_delta_within(next, Duration::hours(4));
    }

    #[test]
    fn test_cadence_none_active_vs_quiet_quarter() {
        for _ in 0..20 {
            let next = next_check_after(TranscriptStatus::None, None, target(), t0());
            let delta = next - t0();
            assert!(delta >= Duration::hours(4) && delta <= Duration::hours(6));
        }

        let old = QuarterYear::new(Quarter::Q1, 2025);
        let next = next_check_after(TranscriptStatus::None, None, old, t0());
        assert_delta_within(next, Duration::hours(24));
    }

    #[test]
    fn test_cadence_error_backoff() {
        // 60, 120, 240, 480, 960 s then the 1 h clamp.
        for (attempts, expected) in [(1, 60), (2, 120), (3, 240), (4, 480), (5, 960)] {
            assert_eq!(
                next_check_after_error(attempts, t0()) - t0(),
                Duration::seconds(expected)
            );
        }
        assert_eq!(next_check_after_error(12, t0()) - t0(), Duration::hours(1));
    }

    // -- sync + dispatch ----------------------------------------------------

    #[test]
    fn test_sync_creates_lanes_and_prunes() {
        let s = store();
        let watched = seed_equity(&s, "INE-A", "ALPHA");
        let grouped = seed_equity(&s, "INE-B", "BETA");
        let both = seed_equity(&s, "INE-C", "GAMMA");
        let departed = seed_equity(&s, "INE-D", "DELTA");

        s.add_to_watchlist(watched, t0()).unwrap();
        s.add_to_watchlist(both, t0()).unwrap();
        let g = s.insert_group("G", Some("deep"), None, true, t0()).unwrap();
        s.add_group_member(g, grouped, t0()).unwrap();
        s.add_group_member(g, both, t0()).unwrap();

        // A leftover row for an equity no longer tracked.
        s.ensure_schedule_row(departed, target(), PRIORITY_WATCHLIST, t0())
            .unwrap();

        let summary = sync_schedule(&s, t0()).expect("sync");
        assert_eq!(summary.target, target());
        assert_eq!(summary.rows_deleted, 1);

        let watched_row = s.get_schedule_for_slot(watched, target()).unwrap().unwrap();
        assert_eq!(watched_row.priority, PRIORITY_WATCHLIST);
        let grouped_row = s.get_schedule_for_slot(grouped, target()).unwrap().unwrap();
        assert_eq!(grouped_row.priority, PRIORITY_GROUP);
        // Watchlist wins when an equity is in both sets.
        let both_row = s.get_schedule_for_slot(both, target()).unwrap().unwrap();
        assert_eq!(both_row.priority, PRIORITY_WATCHLIST);
        assert!(s.get_schedule_for_slot(departed, target()).unwrap().is_none());
    }

    #[test]
    fn test_window_advancement_on_new_quarter() {
        let s = store();
        let e = seed_equity(&s, "INE-A", "ALPHA");
        s.add_to_watchlist(e, t0()).unwrap();

        sync_schedule(&s, t0()).expect("sync q3");
        assert!(s.get_schedule_for_slot(e, target()).unwrap().is_some());

        // Cross into April 2026: the target becomes Q4 FY26 and the sync
        // materialises the new row while keeping the old one.
        let april = t0() + Duration::days(85);
        let summary = sync_schedule(&s, april).expect("sync q4");
        assert_eq!(summary.target, QuarterYear::new(Quarter::Q4, 2026));
        assert!(s
            .get_schedule_for_slot(e, QuarterYear::new(Quarter::Q4, 2026))
            .unwrap()
            .is_some());
        assert!(s.get_schedule_for_slot(e, target()).unwrap().is_some());
    }

    #[test]
    fn test_dispatch_publishes_checks() {
        let s = store();
        let e = seed_equity(&s, "INE-A", "ALPHA");
        s.add_to_watchlist(e, t0()).unwrap();
        sync_schedule(&s, t0()).expect("sync");

        let published = dispatch_due(&s, t0()).expect("dispatch");
        assert_eq!(published, 1);

        let claimed = s.claim(QueueName::TranscriptCheck, 10, t0()).unwrap();
        assert_eq!(claimed.len(), 1);
        let msg: TranscriptCheckMsg = claimed[0].decode().unwrap();
        assert_eq!(msg.equity_id, e);
        assert_eq!(msg.quarter, Quarter::Q3);

        // The row is leased: a second dispatch pass publishes nothing.
        assert_eq!(dispatch_due(&s, t0()).expect("dispatch"), 0);
    }

    #[test]
    fn test_trigger_message_forces_pass() {
        let s = store();
        assert!(!drain_trigger_messages(&s, t0()).unwrap());

        s.publish(
            QueueName::SchedulerTick,
            &serde_json::json!({ "origin": "admin" }),
            Duration::zero(),
            t0(),
        )
        .unwrap();
        assert!(drain_trigger_messages(&s, t0()).unwrap());
        // Drained messages are acked.
        assert_eq!(s.queue_len(QueueName::SchedulerTick).unwrap(), 0);
    }

    #[test]
    fn test_job_sweep_republishes_due_jobs() {
        let s = store();
        let e = seed_equity(&s, "INE-A", "ALPHA");
        let (t, _, _) = s
            .upsert_available(e, target(), "https://x.example/a.pdf", None, t0())
            .unwrap();
        let job = s
            .enqueue_analysis_job(t, false, t0())
            .unwrap()
            .job()
            .unwrap()
            .clone();

        let published = sweep_due_analysis_jobs(&s, t0()).expect("sweep");
        assert_eq!(published, 1);

        let claimed = s.claim(QueueName::AnalysisRequest, 10, t0()).unwrap();
        let msg: AnalysisRequestMsg = claimed[0].decode().unwrap();
        assert_eq!(msg.job_id, job.id);
        assert_eq!(msg.source_url, "https://x.example/a.pdf");

        // The job was re-leased by the sweep: no duplicate publish.
        assert_eq!(sweep_due_analysis_jobs(&s, t0()).expect("sweep"), 0);
    }
}
