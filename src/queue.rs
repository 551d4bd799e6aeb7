//! Durable message broker layered on the store.
//!
//! At-least-once delivery with visibility leases: claiming a message hides
//! it for the lease and bumps `attempts`; an unacked message reappears
//! when the lease lapses. Delivery is FIFO by `(available_at, id)` within
//! a queue. A nack past the queue's attempt ceiling moves the message to
//! the dead-letter table.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{parse_ts, ts};
use crate::fiscal::Quarter;
use crate::store::{Store, StoreError};

/// The named queues the pipeline runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    TranscriptCheck,
    AnalysisRequest,
    GroupResearch,
    SchedulerTick,
}

impl QueueName {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::TranscriptCheck => "transcript_check",
            QueueName::AnalysisRequest => "analysis_request",
            QueueName::GroupResearch => "group_research_request",
            QueueName::SchedulerTick => "scheduler_tick",
        }
    }

    /// Per-queue attempt ceiling before dead-lettering.
    pub fn max_attempts(self) -> i64 {
        match self {
            QueueName::TranscriptCheck => 8,
            QueueName::AnalysisRequest => 6,
            QueueName::GroupResearch => 6,
            QueueName::SchedulerTick => 2,
        }
    }

    /// Visibility lease while a consumer works a message.
    pub fn lease(self) -> Duration {
        match self {
            QueueName::TranscriptCheck => Duration::minutes(2),
            QueueName::AnalysisRequest => Duration::minutes(15),
            QueueName::GroupResearch => Duration::minutes(15),
            QueueName::SchedulerTick => Duration::minutes(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Payload encode/decode failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A claimed message.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: i64,
    pub queue: String,
    pub payload: String,
    pub available_at: DateTime<Utc>,
    pub attempts: i64,
}

impl QueueMessage {
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Ask a fetcher to poll one schedule row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptCheckMsg {
    pub schedule_id: i64,
    pub equity_id: i64,
    pub quarter: Quarter,
    pub year: i32,
}

/// Ask an analysis worker to run one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequestMsg {
    pub job_id: i64,
    pub transcript_id: i64,
    pub source_url: String,
    pub force: bool,
}

/// Group research traffic: an analysis-completion observation, or a
/// dispatched run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupResearchMsg {
    Observe {
        equity_id: i64,
        quarter: Quarter,
        year: i32,
    },
    Run {
        group_id: i64,
        quarter: Quarter,
        year: i32,
        force: bool,
    },
}

impl Store {
    /// Publish a payload, visible after `delay`.
    pub fn publish<T: Serialize>(
        &self,
        queue: QueueName,
        payload: &T,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<i64, QueueError> {
        let body = serde_json::to_string(payload)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO queue_messages (queue_name, payload, available_at, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![queue.as_str(), body, ts(now + delay), ts(now)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Claim up to `batch` visible messages, oldest first, taking the
    /// queue's lease and bumping `attempts` on each.
    pub fn claim(
        &self,
        queue: QueueName,
        batch: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let mut messages = {
            let mut stmt = tx.prepare(
                "SELECT id, queue_name, payload, available_at, attempts
                 FROM queue_messages
                 WHERE queue_name = ?1 AND available_at <= ?2
                   AND (locked_until IS NULL OR locked_until < ?2)
                 ORDER BY available_at ASC, id ASC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![queue.as_str(), ts(now), batch as i64], |row| {
                let available_at: String = row.get(3)?;
                Ok(QueueMessage {
                    id: row.get(0)?,
                    queue: row.get(1)?,
                    payload: row.get(2)?,
                    available_at: parse_ts(&available_at).unwrap_or_default(),
                    attempts: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let lock = ts(now + queue.lease());
        for message in &mut messages {
            tx.execute(
                "UPDATE queue_messages SET locked_until = ?1, attempts = attempts + 1
                 WHERE id = ?2",
                params![lock, message.id],
            )?;
            message.attempts += 1;
        }
        tx.commit()?;
        Ok(messages)
    }

    /// Acknowledge: the message is done and removed from the live set.
    pub fn ack(&self, message_id: i64) -> Result<(), QueueError> {
        self.conn()
            .execute("DELETE FROM queue_messages WHERE id = ?1", params![message_id])?;
        Ok(())
    }

    /// Negative-acknowledge with backoff. Past the queue's attempt
    /// ceiling, the message becomes a dead-letter record instead.
    /// Returns `true` when the message was dead-lettered.
    pub fn nack(
        &self,
        message_id: i64,
        backoff: Duration,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let row: Option<(String, String, i64)> = tx
            .query_row(
                "SELECT queue_name, payload, attempts FROM queue_messages WHERE id = ?1",
                params![message_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((queue_name, payload, attempts)) = row else {
            tx.commit()?;
            return Ok(false);
        };

        let max_attempts = match queue_name.as_str() {
            "transcript_check" => QueueName::TranscriptCheck.max_attempts(),
            "analysis_request" => QueueName::AnalysisRequest.max_attempts(),
            "group_research_request" => QueueName::GroupResearch.max_attempts(),
            "scheduler_tick" => QueueName::SchedulerTick.max_attempts(),
            _ => 6,
        };

        let dead = attempts >= max_attempts;
        if dead {
            tx.execute(
                "INSERT INTO queue_dead_letters (queue_name, payload, attempts, error, dead_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![queue_name, payload, attempts, error, ts(now)],
            )?;
            tx.execute(
                "DELETE FROM queue_messages WHERE id = ?1",
                params![message_id],
            )?;
            log::warn!(
                "Dead-lettered {} message {} after {} attempts: {}",
                queue_name,
                message_id,
                attempts,
                error
            );
        } else {
            tx.execute(
                "UPDATE queue_messages
                 SET available_at = ?1, locked_until = NULL
                 WHERE id = ?2",
                params![ts(now + backoff), message_id],
            )?;
        }
        tx.commit()?;
        Ok(dead)
    }

    /// Extend the lease on a long-running message.
    pub fn extend(
        &self,
        message_id: i64,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.conn().execute(
            "UPDATE queue_messages SET locked_until = ?1 WHERE id = ?2",
            params![ts(now + lease), message_id],
        )?;
        Ok(())
    }

    /// Live depth of a queue (for the admin status surface).
    pub fn queue_len(&self, queue: QueueName) -> Result<i64, QueueError> {
        let len = self.conn().query_row(
            "SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?1",
            params![queue.as_str()],
            |row| row.get(0),
        )?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 9, 0, 0).unwrap()
    }

    fn store() -> Store {
        Store::open_in_memory().expect("store")
    }

    fn tick_payload() -> serde_json::Value {
        serde_json::json!({ "reason": "test" })
    }

    #[test]
    fn test_fifo_within_queue() {
        let store = store();
        let first = store
            .publish(QueueName::SchedulerTick, &tick_payload(), Duration::zero(), t0())
            .unwrap();
        let second = store
            .publish(QueueName::SchedulerTick, &tick_payload(), Duration::zero(), t0())
            .unwrap();

        let claimed = store.claim(QueueName::SchedulerTick, 10, t0()).unwrap();
        let ids: Vec<i64> = claimed.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn test_delayed_delivery() {
        let store = store();
        store
            .publish(
                QueueName::SchedulerTick,
                &tick_payload(),
                Duration::minutes(5),
                t0(),
            )
            .unwrap();

        assert!(store.claim(QueueName::SchedulerTick, 10, t0()).unwrap().is_empty());
        assert!(store
            .claim(QueueName::SchedulerTick, 10, t0() + Duration::minutes(4))
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .claim(QueueName::SchedulerTick, 10, t0() + Duration::minutes(5))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_lease_hides_then_redelivers() {
        let store = store();
        store
            .publish(QueueName::TranscriptCheck, &tick_payload(), Duration::zero(), t0())
            .unwrap();

        let claimed = store.claim(QueueName::TranscriptCheck, 1, t0()).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);

        // Hidden while leased.
        assert!(store.claim(QueueName::TranscriptCheck, 1, t0()).unwrap().is_empty());

        // Redelivered after lease expiry with attempts grown.
        let later = t0() + QueueName::TranscriptCheck.lease() + Duration::seconds(1);
        let redelivered = store.claim(QueueName::TranscriptCheck, 1, later).unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].attempts, 2);
    }

    #[test]
    fn test_ack_removes() {
        let store = store();
        store
            .publish(QueueName::TranscriptCheck, &tick_payload(), Duration::zero(), t0())
            .unwrap();
        let claimed = store.claim(QueueName::TranscriptCheck, 1, t0()).unwrap();
        store.ack(claimed[0].id).unwrap();

        let later = t0() + Duration::hours(1);
        assert!(store.claim(QueueName::TranscriptCheck, 1, later).unwrap().is_empty());
        assert_eq!(store.queue_len(QueueName::TranscriptCheck).unwrap(), 0);
    }

    #[test]
    fn test_nack_backoff_then_dead_letter() {
        let store = store();
        store
            .publish(QueueName::SchedulerTick, &tick_payload(), Duration::zero(), t0())
            .unwrap();

        // First claim + nack: redelivered after the backoff.
        let claimed = store.claim(QueueName::SchedulerTick, 1, t0()).unwrap();
        let dead = store
            .nack(claimed[0].id, Duration::seconds(30), "boom", t0())
            .unwrap();
        assert!(!dead);
        assert!(store
            .claim(QueueName::SchedulerTick, 1, t0() + Duration::seconds(29))
            .unwrap()
            .is_empty());

        // Second claim hits the scheduler_tick ceiling (2): dead-lettered.
        let reclaimed = store
            .claim(QueueName::SchedulerTick, 1, t0() + Duration::seconds(30))
            .unwrap();
        assert_eq!(reclaimed[0].attempts, 2);
        let dead = store
            .nack(reclaimed[0].id, Duration::seconds(30), "boom again", t0())
            .unwrap();
        assert!(dead);
        assert_eq!(store.queue_len(QueueName::SchedulerTick).unwrap(), 0);

        let letters: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM queue_dead_letters", [], |row| row.get(0))
            .unwrap();
        assert_eq!(letters, 1);
    }

    #[test]
    fn test_extend_keeps_message_hidden() {
        let store = store();
        store
            .publish(QueueName::TranscriptCheck, &tick_payload(), Duration::zero(), t0())
            .unwrap();
        let claimed = store.claim(QueueName::TranscriptCheck, 1, t0()).unwrap();

        store
            .extend(claimed[0].id, Duration::minutes(30), t0())
            .unwrap();
        let past_original_lease = t0() + QueueName::TranscriptCheck.lease() + Duration::minutes(1);
        assert!(store
            .claim(QueueName::TranscriptCheck, 1, past_original_lease)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_payload_round_trip() {
        let store = store();
        let msg = TranscriptCheckMsg {
            schedule_id: 3,
            equity_id: 7,
            quarter: Quarter::Q3,
            year: 2026,
        };
        store
            .publish(QueueName::TranscriptCheck, &msg, Duration::zero(), t0())
            .unwrap();

        let claimed = store.claim(QueueName::TranscriptCheck, 1, t0()).unwrap();
        let decoded: TranscriptCheckMsg = claimed[0].decode().unwrap();
        assert_eq!(decoded.schedule_id, 3);
        assert_eq!(decoded.quarter, Quarter::Q3);

        let research = GroupResearchMsg::Run {
            group_id: 1,
            quarter: Quarter::Q2,
            year: 2026,
            force: true,
        };
        store
            .publish(QueueName::GroupResearch, &research, Duration::zero(), t0())
            .unwrap();
        let claimed = store.claim(QueueName::GroupResearch, 1, t0()).unwrap();
        match claimed[0].decode::<GroupResearchMsg>().unwrap() {
            GroupResearchMsg::Run { group_id, force, .. } => {
                assert_eq!(group_id, 1);
                assert!(force);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_queues_are_isolated() {
        let store = store();
        store
            .publish(QueueName::TranscriptCheck, &tick_payload(), Duration::zero(), t0())
            .unwrap();
        assert!(store.claim(QueueName::AnalysisRequest, 10, t0()).unwrap().is_empty());
    }
}
