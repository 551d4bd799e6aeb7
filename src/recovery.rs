//! Startup recovery: release state orphaned by a crash.
//!
//! Leases make in-flight work self-healing while the process lives; this
//! pass handles the restart case so nothing waits a full lease after
//! boot. Idempotency keys guarantee the re-enqueues cannot duplicate
//! completed analyses.

use chrono::{DateTime, Duration, Utc};

use crate::queue::{AnalysisRequestMsg, QueueName};
use crate::store::{EnqueueOutcome, Store, StoreError};

/// A reservation untouched this long is considered orphaned.
const STALE_RESERVATION_MINUTES: i64 = 5;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub stale_reservations_reset: usize,
    pub analysis_jobs_recovered: usize,
    pub analysis_jobs_requeued: usize,
}

/// Run once before the workers start.
pub fn run_startup_recovery(
    store: &Store,
    now: DateTime<Utc>,
) -> Result<RecoverySummary, StoreError> {
    let mut summary = RecoverySummary::default();

    // Transcripts a dead worker left reserved.
    let cutoff = now - Duration::minutes(STALE_RESERVATION_MINUTES);
    let stale = store.stale_analysis_reservations(cutoff)?;
    for &transcript_id in &stale {
        store.release_analysis_reservation(transcript_id, now)?;
    }
    summary.stale_reservations_reset = stale.len();

    // Jobs stuck in_progress past their lease go back to pending.
    summary.analysis_jobs_recovered = store.recover_expired_analysis_jobs(now)?;

    // Re-enqueue analyses for the orphaned transcripts; the idempotency
    // key collapses onto any still-live job.
    for &transcript_id in &stale {
        let outcome = store.enqueue_analysis_job(transcript_id, false, now)?;
        if let Some(job) = outcome.job() {
            let Some(transcript) = store.get_transcript(transcript_id)? else {
                continue;
            };
            let Some(source_url) = transcript.source_url else {
                continue;
            };
            let is_new = matches!(outcome, EnqueueOutcome::Created(_));
            if is_new {
                let msg = AnalysisRequestMsg {
                    job_id: job.id,
                    transcript_id,
                    source_url,
                    force: false,
                };
                if store
                    .publish(QueueName::AnalysisRequest, &msg, Duration::zero(), now)
                    .is_ok()
                {
                    summary.analysis_jobs_requeued += 1;
                }
            }
        }
    }

    if summary != RecoverySummary::default() {
        log::info!(
            "Recovery: reset {} reservations, recovered {} jobs, requeued {}",
            summary.stale_reservations_reset,
            summary.analysis_jobs_recovered,
            summary.analysis_jobs_requeued
        );
    }
    Ok(summary)
}
