//! Fetcher worker pool: turns `transcript_check` messages into oracle
//! calls and durable transcript state.
//!
//! Each worker claims one message at a time. The oracle call happens with
//! no store transaction open; results are persisted in a short write
//! burst, and a newly-available transcript fans into an
//! `analysis_request` when the equity is eligible.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use crate::clock::Clock;
use crate::fiscal::{target_quarter, QuarterYear};
use crate::oracle::{OracleError, OracleStatus, TranscriptOracle};
use crate::queue::{AnalysisRequestMsg, QueueMessage, QueueName, TranscriptCheckMsg};
use crate::rate_limit::AdaptiveLimiter;
use crate::retry::schedule_backoff;
use crate::scheduler::{next_check_after, next_check_after_error};
use crate::store::types::TranscriptStatus;
use crate::store::{EnqueueOutcome, Store};

/// Idle poll interval when the queue is empty.
const IDLE_SLEEP_MS: u64 = 1000;

pub struct Fetcher {
    id: usize,
    store: Store,
    oracle: Arc<dyn TranscriptOracle>,
    limiter: Arc<AdaptiveLimiter>,
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
}

impl Fetcher {
    pub fn new(
        id: usize,
        store: Store,
        oracle: Arc<dyn TranscriptOracle>,
        limiter: Arc<AdaptiveLimiter>,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            store,
            oracle,
            limiter,
            clock,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        log::info!("Fetcher[{}]: started", self.id);
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let now = self.clock.now();
            let claimed = match self.store.claim(QueueName::TranscriptCheck, 1, now) {
                Ok(claimed) => claimed,
                Err(e) => {
                    log::warn!("Fetcher[{}]: claim failed: {}", self.id, e);
                    Vec::new()
                }
            };

            let Some(message) = claimed.into_iter().next() else {
                tokio::time::sleep(std::time::Duration::from_millis(IDLE_SLEEP_MS)).await;
                continue;
            };

            if let Err(e) = self.process(&message).await {
                // Processing translates every expected outcome into durable
                // state; an error here is store-level and the lease will
                // redeliver the message.
                log::warn!(
                    "Fetcher[{}]: message {} failed: {}",
                    self.id,
                    message.id,
                    e
                );
            }
        }
        log::info!("Fetcher[{}]: stopped", self.id);
    }

    /// Work one claimed `transcript_check` message to completion.
    pub async fn process(&self, message: &QueueMessage) -> Result<(), String> {
        let check: TranscriptCheckMsg = message.decode().map_err(|e| e.to_string())?;
        let now = self.clock.now();
        let slot = QuarterYear::new(check.quarter, check.year);

        // Stale message guards: the row or equity may be gone.
        let Some(row) = self
            .store
            .get_schedule_row(check.schedule_id)
            .map_err(|e| e.to_string())?
        else {
            self.store.ack(message.id).map_err(|e| e.to_string())?;
            return Ok(());
        };
        if row.equity_id != check.equity_id || QuarterYear::new(row.quarter, row.year) != slot {
            self.store.ack(message.id).map_err(|e| e.to_string())?;
            return Ok(());
        }
        let Some(equity) = self
            .store
            .get_equity(check.equity_id)
            .map_err(|e| e.to_string())?
        else {
            self.store
                .release_schedule_lock(row.id, now)
                .map_err(|e| e.to_string())?;
            self.store.ack(message.id).map_err(|e| e.to_string())?;
            return Ok(());
        };
        if equity.oracle_symbol().is_none() && equity.identifier.is_empty() {
            self.store
                .release_schedule_lock(row.id, now)
                .map_err(|e| e.to_string())?;
            self.store.ack(message.id).map_err(|e| e.to_string())?;
            return Ok(());
        }

        self.limiter.acquire().await;
        let outcome = self.oracle.check(&equity, slot).await;
        let now = self.clock.now();

        match outcome {
            Ok(status) => {
                self.limiter.on_success();
                self.apply_result(&check, slot, status, now)?;
                self.store.ack(message.id).map_err(|e| e.to_string())?;
            }
            Err(OracleError::RateLimited) => {
                // Shrink the bucket and put the message back with backoff.
                // The schedule row keeps its state (no error recorded) and
                // its lease, so the scheduler cannot double-dispatch it
                // while the nacked message waits.
                self.limiter.on_rate_limited();
                let backoff = schedule_backoff(message.attempts.max(0) as u32);
                self.store
                    .nack(message.id, backoff, "oracle rate limited", now)
                    .map_err(|e| e.to_string())?;
            }
            Err(OracleError::Transient(reason)) => {
                let next = next_check_after_error(row.attempts + 1, now);
                self.store
                    .record_check_error(row.id, false, next, now)
                    .map_err(|e| e.to_string())?;
                log::warn!(
                    "Fetcher[{}]: transient oracle error for equity {} ({}): {}",
                    self.id,
                    check.equity_id,
                    slot,
                    reason
                );
                self.store.ack(message.id).map_err(|e| e.to_string())?;
            }
            Err(OracleError::Permanent(reason)) => {
                self.store
                    .record_check_error(row.id, true, now + Duration::hours(24), now)
                    .map_err(|e| e.to_string())?;
                log::warn!(
                    "Fetcher[{}]: permanent oracle error for equity {} ({}): {}",
                    self.id,
                    check.equity_id,
                    slot,
                    reason
                );
                self.store.ack(message.id).map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }

    fn apply_result(
        &self,
        check: &TranscriptCheckMsg,
        slot: QuarterYear,
        status: OracleStatus,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        match status {
            OracleStatus::Available {
                source_url,
                event_date,
            } => {
                let (transcript_id, _, _) = self
                    .store
                    .upsert_available(check.equity_id, slot, &source_url, event_date, now)
                    .map_err(|e| e.to_string())?;
                let new_event = self
                    .store
                    .record_event(
                        check.equity_id,
                        slot,
                        TranscriptStatus::Available,
                        Some(&source_url),
                        event_date,
                        "poll",
                        now,
                    )
                    .map_err(|e| e.to_string())?;

                if new_event && self.auto_analysis_eligible(check.equity_id, slot, now)? {
                    self.enqueue_analysis(transcript_id, now)?;
                }

                let next = next_check_after(TranscriptStatus::Available, event_date, slot, now);
                self.store
                    .complete_check(check.schedule_id, "available", next, true, now)
                    .map_err(|e| e.to_string())?;
            }
            OracleStatus::Upcoming { event_date } => {
                self.store
                    .upsert_upcoming(check.equity_id, slot, Some(event_date), now)
                    .map_err(|e| e.to_string())?;
                self.store
                    .record_event(
                        check.equity_id,
                        slot,
                        TranscriptStatus::Upcoming,
                        None,
                        Some(event_date),
                        "poll",
                        now,
                    )
                    .map_err(|e| e.to_string())?;

                let next =
                    next_check_after(TranscriptStatus::Upcoming, Some(event_date), slot, now);
                self.store
                    .complete_check(check.schedule_id, "upcoming", next, false, now)
                    .map_err(|e| e.to_string())?;
            }
            OracleStatus::None => {
                self.store
                    .record_event(
                        check.equity_id,
                        slot,
                        TranscriptStatus::None,
                        None,
                        None,
                        "poll",
                        now,
                    )
                    .map_err(|e| e.to_string())?;
                let next = next_check_after(TranscriptStatus::None, None, slot, now);
                self.store
                    .complete_check(check.schedule_id, "none", next, false, now)
                    .map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }

    /// Watchlist equities always auto-analyse; group-only equities do so
    /// only when the slot is the group's current target quarter.
    fn auto_analysis_eligible(
        &self,
        equity_id: i64,
        slot: QuarterYear,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        if self
            .store
            .is_on_watchlist(equity_id)
            .map_err(|e| e.to_string())?
        {
            return Ok(true);
        }
        Ok(slot == target_quarter(now)
            && self
                .store
                .in_active_group(equity_id)
                .map_err(|e| e.to_string())?)
    }

    fn enqueue_analysis(&self, transcript_id: i64, now: DateTime<Utc>) -> Result<(), String> {
        let outcome = self
            .store
            .enqueue_analysis_job(transcript_id, false, now)
            .map_err(|e| e.to_string())?;
        if let EnqueueOutcome::Created(job) = outcome {
            let transcript = self
                .store
                .get_transcript(transcript_id)
                .map_err(|e| e.to_string())?
                .ok_or_else(|| "transcript vanished".to_string())?;
            let Some(source_url) = transcript.source_url else {
                return Ok(());
            };
            let msg = AnalysisRequestMsg {
                job_id: job.id,
                transcript_id,
                source_url,
                force: false,
            };
            self.store
                .publish(QueueName::AnalysisRequest, &msg, Duration::zero(), now)
                .map_err(|e| e.to_string())?;
            log::info!(
                "Fetcher[{}]: queued analysis job {} for transcript {}",
                self.id,
                job.id,
                transcript_id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fiscal::Quarter;
    use crate::store::test_support::{seed_equity, store, t0};
    use crate::store::types::Equity;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted oracle: pops the next response per call.
    struct ScriptedOracle {
        responses: Mutex<Vec<Result<OracleStatus, OracleError>>>,
    }

    impl ScriptedOracle {
        fn new(mut responses: Vec<Result<OracleStatus, OracleError>>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl TranscriptOracle for ScriptedOracle {
        async fn check(
            &self,
            _equity: &Equity,
            _slot: QuarterYear,
        ) -> Result<OracleStatus, OracleError> {
            self.responses
                .lock()
                .expect("script lock")
                .pop()
                .unwrap_or(Ok(OracleStatus::None))
        }

        async fn download(&self, _source_url: &str) -> Result<Vec<u8>, OracleError> {
            Ok(b"transcript text".to_vec())
        }
    }

    fn slot() -> QuarterYear {
        QuarterYear::new(Quarter::Q3, 2026)
    }

    fn fetcher_with(store: Store, oracle: Arc<dyn TranscriptOracle>) -> Fetcher {
        let (_tx, rx) = watch::channel(false);
        Fetcher::new(
            0,
            store,
            oracle,
            Arc::new(AdaptiveLimiter::new(100)),
            Arc::new(ManualClock::new(t0())),
            rx,
        )
    }

    /// Seed a watchlisted equity with a due, claimed schedule row and a
    /// published check message; return the claimed message.
    fn seed_check(s: &Store) -> (i64, QueueMessage) {
        let e = seed_equity(s, "INE-A", "ALPHA");
        s.add_to_watchlist(e, t0()).unwrap();
        s.ensure_schedule_row(e, slot(), 10, t0()).unwrap();
        crate::scheduler::dispatch_due(s, t0()).unwrap();
        let claimed = s.claim(QueueName::TranscriptCheck, 1, t0()).unwrap();
        (e, claimed.into_iter().next().expect("one message"))
    }

    #[tokio::test]
    async fn test_available_writes_state_and_queues_analysis() {
        let s = store();
        let (e, message) = seed_check(&s);

        let oracle = ScriptedOracle::new(vec![Ok(OracleStatus::Available {
            source_url: "https://x.example/a.pdf".into(),
            event_date: None,
        })]);
        let fetcher = fetcher_with(s, oracle);

        fetcher.process(&message).await.expect("process");
        let s = fetcher.store;

        let transcript = s.get_transcript_for_slot(e, slot()).unwrap().unwrap();
        assert_eq!(transcript.status, TranscriptStatus::Available);

        // Analysis request published with an idempotency-keyed job behind it.
        let analysis = s.claim(QueueName::AnalysisRequest, 10, t0()).unwrap();
        assert_eq!(analysis.len(), 1);

        // Schedule row rescheduled ~24 h out, message gone.
        let row = s.get_schedule_for_slot(e, slot()).unwrap().unwrap();
        assert_eq!(row.last_status.as_deref(), Some("available"));
        assert!(row.next_check_at.unwrap() >= t0() + Duration::hours(24));
        assert_eq!(s.queue_len(QueueName::TranscriptCheck).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_second_available_observation_does_not_duplicate_analysis() {
        let s = store();
        let (_e, message) = seed_check(&s);

        let oracle = ScriptedOracle::new(vec![
            Ok(OracleStatus::Available {
                source_url: "https://x.example/a.pdf".into(),
                event_date: None,
            }),
            Ok(OracleStatus::Available {
                source_url: "https://x.example/a.pdf".into(),
                event_date: None,
            }),
        ]);
        let fetcher = fetcher_with(s, oracle);
        fetcher.process(&message).await.expect("first");

        // Re-dispatch the row for a second poll of the same URL (past the
        // 24 h cadence plus its full jitter allowance).
        let s = &fetcher.store;
        let later = t0() + Duration::hours(29);
        let row = s
            .claim_due_schedule(1, later)
            .unwrap()
            .into_iter()
            .next()
            .expect("row due again");
        s.publish(
            QueueName::TranscriptCheck,
            &TranscriptCheckMsg {
                schedule_id: row.id,
                equity_id: row.equity_id,
                quarter: row.quarter,
                year: row.year,
            },
            Duration::zero(),
            later,
        )
        .unwrap();
        let message = s
            .claim(QueueName::TranscriptCheck, 1, later)
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        fetcher.process(&message).await.expect("second");

        // Only the first observation produced an analysis request.
        let pending = fetcher
            .store
            .claim(QueueName::AnalysisRequest, 10, later)
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_group_only_equity_old_quarter_not_auto_analysed() {
        let s = store();
        let e = seed_equity(&s, "INE-A", "ALPHA");
        let g = s.insert_group("G", Some("deep"), None, true, t0()).unwrap();
        s.add_group_member(g, e, t0()).unwrap();

        // Old quarter row (not the Q3 FY26 target).
        let old = QuarterYear::new(Quarter::Q1, 2026);
        s.ensure_schedule_row(e, old, 20, t0()).unwrap();
        crate::scheduler::dispatch_due(&s, t0()).unwrap();
        let message = s
            .claim(QueueName::TranscriptCheck, 1, t0())
            .unwrap()
            .into_iter()
            .next()
            .unwrap();

        let oracle = ScriptedOracle::new(vec![Ok(OracleStatus::Available {
            source_url: "https://x.example/old.pdf".into(),
            event_date: None,
        })]);
        let fetcher = fetcher_with(s, oracle);
        fetcher.process(&message).await.expect("process");

        // Stored, but no analysis queued for a non-current quarter.
        let s = fetcher.store;
        assert!(s.get_transcript_for_slot(e, old).unwrap().is_some());
        assert_eq!(s.queue_len(QueueName::AnalysisRequest).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_error_backs_off_schedule() {
        let s = store();
        let (e, message) = seed_check(&s);

        let oracle = ScriptedOracle::new(vec![Err(OracleError::Transient("502".into()))]);
        let fetcher = fetcher_with(s, oracle);
        fetcher.process(&message).await.expect("process");

        let s = fetcher.store;
        let row = s.get_schedule_for_slot(e, slot()).unwrap().unwrap();
        assert_eq!(row.attempts, 1);
        assert!(row.last_status.is_none());
        // First transient failure: retry in 60 s.
        assert_eq!(row.next_check_at, Some(t0() + Duration::seconds(60)));
        assert_eq!(s.queue_len(QueueName::TranscriptCheck).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_nacks_without_error_state() {
        let s = store();
        let (e, message) = seed_check(&s);

        let oracle = ScriptedOracle::new(vec![Err(OracleError::RateLimited)]);
        let limiter = Arc::new(AdaptiveLimiter::new(2));
        let (_tx, rx) = watch::channel(false);
        let fetcher = Fetcher::new(
            0,
            s,
            oracle,
            limiter.clone(),
            Arc::new(ManualClock::new(t0())),
            rx,
        );
        fetcher.process(&message).await.expect("process");

        // Bucket halved, message redelivered later, row untouched.
        assert_eq!(limiter.current_per_minute(), 60);
        let s = fetcher.store;
        let row = s.get_schedule_for_slot(e, slot()).unwrap().unwrap();
        assert!(row.last_status.is_none());
        assert_eq!(row.attempts, 0);
        assert_eq!(s.queue_len(QueueName::TranscriptCheck).unwrap(), 1);
        assert!(s.claim(QueueName::TranscriptCheck, 1, t0()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_error_marks_row() {
        let s = store();
        let (e, message) = seed_check(&s);

        let oracle = ScriptedOracle::new(vec![Err(OracleError::Permanent("401".into()))]);
        let fetcher = fetcher_with(s, oracle);
        fetcher.process(&message).await.expect("process");

        let s = fetcher.store;
        let row = s.get_schedule_for_slot(e, slot()).unwrap().unwrap();
        assert_eq!(row.last_status.as_deref(), Some("error"));
        assert_eq!(row.next_check_at, Some(t0() + Duration::hours(24)));
    }

    #[tokio::test]
    async fn test_stale_message_acked_quietly() {
        let s = store();
        let (_e, message) = seed_check(&s);

        // Delete the schedule row out from under the message.
        s.conn().execute("DELETE FROM fetch_schedule", []).unwrap();

        let oracle = ScriptedOracle::new(vec![]);
        let fetcher = fetcher_with(s, oracle);
        fetcher.process(&message).await.expect("process");
        assert_eq!(
            fetcher.store.queue_len(QueueName::TranscriptCheck).unwrap(),
            0
        );
    }
}
