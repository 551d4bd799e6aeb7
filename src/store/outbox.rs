//! The email outbox and the recipient list.
//!
//! Outbox rows are claimed with the same lease pattern as queue messages
//! but stay inspectable as rows: the UI derives "retrying" from
//! `attempts` and `retry_next_at` rather than a hidden broker state.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

use super::types::{OutboxRow, OutboxStatus};
use super::{Store, StoreError};
use crate::clock::{parse_ts, ts};

/// Lease on a claimed outbox row.
pub const OUTBOX_LEASE: Duration = Duration::minutes(15);

fn outbox_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxRow> {
    let status: String = row.get(4)?;
    let scheduled_at: String = row.get(6)?;
    let retry_next_at: Option<String> = row.get(7)?;
    let locked_until: Option<String> = row.get(8)?;
    Ok(OutboxRow {
        id: row.get(0)?,
        analysis_id: row.get(1)?,
        research_run_id: row.get(2)?,
        recipient: row.get(3)?,
        status: OutboxStatus::parse(&status).unwrap_or(OutboxStatus::Pending),
        attempts: row.get(5)?,
        scheduled_at: parse_ts(&scheduled_at).unwrap_or_default(),
        retry_next_at: retry_next_at.as_deref().and_then(parse_ts),
        locked_until: locked_until.as_deref().and_then(parse_ts),
        last_error: row.get(9)?,
    })
}

const OUTBOX_COLS: &str = "id, analysis_id, research_run_id, recipient, status, attempts, \
                           scheduled_at, retry_next_at, locked_until, last_error";

impl Store {
    // =========================================================================
    // Recipients
    // =========================================================================

    pub fn add_recipient(
        &self,
        email: &str,
        is_active: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO email_recipients (email, is_active, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(email) DO UPDATE SET is_active = excluded.is_active",
            params![email, is_active as i64, ts(now)],
        )?;
        Ok(())
    }

    pub fn active_recipients(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT email FROM email_recipients WHERE is_active = 1 ORDER BY id")?;
        let recipients = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(recipients)
    }

    // =========================================================================
    // Outbox
    // =========================================================================

    /// Fan an analysis out to recipients. The partial unique index makes
    /// re-runs no-ops per `(analysis, recipient)`. Returns rows created.
    pub fn enqueue_analysis_emails(
        &self,
        analysis_id: i64,
        recipients: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let mut created = 0;
        for recipient in recipients {
            created += tx.execute(
                "INSERT OR IGNORE INTO email_outbox
                     (analysis_id, recipient, status, attempts, scheduled_at,
                      created_at, updated_at)
                 VALUES (?1, ?2, 'pending', 0, ?3, ?3, ?3)",
                params![analysis_id, recipient, ts(now)],
            )?;
        }
        tx.commit()?;
        Ok(created)
    }

    /// Fan a finished group research run out to recipients.
    pub fn enqueue_research_emails(
        &self,
        research_run_id: i64,
        recipients: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let mut created = 0;
        for recipient in recipients {
            created += tx.execute(
                "INSERT OR IGNORE INTO email_outbox
                     (research_run_id, recipient, status, attempts, scheduled_at,
                      created_at, updated_at)
                 VALUES (?1, ?2, 'pending', 0, ?3, ?3, ?3)",
                params![research_run_id, recipient, ts(now)],
            )?;
        }
        tx.commit()?;
        Ok(created)
    }

    /// Claim up to `limit` sendable rows (pending, retry time reached,
    /// lease lapsed), oldest scheduled first.
    pub fn claim_due_outbox(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRow>, StoreError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let rows = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM email_outbox
                 WHERE status = 'pending'
                   AND (retry_next_at IS NULL OR retry_next_at <= ?1)
                   AND (locked_until IS NULL OR locked_until < ?1)
                 ORDER BY scheduled_at ASC, id ASC
                 LIMIT ?2",
                OUTBOX_COLS
            ))?;
            let result = stmt
                .query_map(params![ts(now), limit as i64], outbox_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            result
        };
        let lock = ts(now + OUTBOX_LEASE);
        for row in &rows {
            tx.execute(
                "UPDATE email_outbox SET locked_until = ?1, updated_at = ?2 WHERE id = ?3",
                params![lock, ts(now), row.id],
            )?;
        }
        tx.commit()?;
        Ok(rows)
    }

    pub fn mark_outbox_sent(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE email_outbox
             SET status = 'sent', last_error = NULL, retry_next_at = NULL, locked_until = NULL,
                 updated_at = ?1
             WHERE id = ?2",
            params![ts(now), id],
        )?;
        Ok(())
    }

    /// Transient send failure: bump attempts and schedule the retry.
    /// Returns the new attempt count.
    pub fn mark_outbox_retry(
        &self,
        id: i64,
        retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.conn().execute(
            "UPDATE email_outbox
             SET attempts = attempts + 1, retry_next_at = ?1, last_error = ?2,
                 locked_until = NULL, updated_at = ?3
             WHERE id = ?4",
            params![ts(retry_at), error, ts(now), id],
        )?;
        let attempts = self.conn().query_row(
            "SELECT attempts FROM email_outbox WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    pub fn mark_outbox_failed(&self, id: i64, error: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE email_outbox
             SET status = 'failed', last_error = ?1, locked_until = NULL, updated_at = ?2
             WHERE id = ?3",
            params![error, ts(now), id],
        )?;
        Ok(())
    }

    pub fn mark_outbox_dead(&self, id: i64, error: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE email_outbox
             SET status = 'dead', last_error = ?1, locked_until = NULL, updated_at = ?2
             WHERE id = ?3",
            params![error, ts(now), id],
        )?;
        Ok(())
    }

    pub fn get_outbox_row(&self, id: i64) -> Result<Option<OutboxRow>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM email_outbox WHERE id = ?1", OUTBOX_COLS),
                params![id],
                outbox_from_row,
            )
            .optional()?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{seed_equity, store, t0};
    use super::*;
    use crate::fiscal::{Quarter, QuarterYear};

    fn seed_analysis(store: &Store) -> i64 {
        let e = seed_equity(store, "INE-A", "ALPHA");
        let (t, _, _) = store
            .upsert_available(
                e,
                QuarterYear::new(Quarter::Q3, 2026),
                "https://x.example/a.pdf",
                None,
                t0(),
            )
            .expect("transcript");
        store
            .insert_analysis(t, "p", "o", "anthropic", "m", None, 1, 1, 0.0, t0())
            .expect("analysis")
    }

    fn recipients(store: &Store) -> Vec<String> {
        store
            .add_recipient("alice@example.com", true, t0())
            .expect("add");
        store
            .add_recipient("bob@example.com", true, t0())
            .expect("add");
        store
            .add_recipient("muted@example.com", false, t0())
            .expect("add");
        store.active_recipients().expect("list")
    }

    #[test]
    fn test_active_recipient_list() {
        let store = store();
        let list = recipients(&store);
        assert_eq!(list, vec!["alice@example.com", "bob@example.com"]);
    }

    #[test]
    fn test_fan_out_is_idempotent() {
        let store = store();
        let analysis = seed_analysis(&store);
        let list = recipients(&store);

        let created = store
            .enqueue_analysis_emails(analysis, &list, t0())
            .expect("enqueue");
        assert_eq!(created, 2);

        // Re-running the fan-out creates nothing new.
        let again = store
            .enqueue_analysis_emails(analysis, &list, t0())
            .expect("enqueue");
        assert_eq!(again, 0);
    }

    #[test]
    fn test_claim_lease_and_send() {
        let store = store();
        let analysis = seed_analysis(&store);
        let list = recipients(&store);
        store.enqueue_analysis_emails(analysis, &list, t0()).unwrap();

        let claimed = store.claim_due_outbox(10, t0()).expect("claim");
        assert_eq!(claimed.len(), 2);

        // Leased rows are invisible to a second claimant.
        assert!(store.claim_due_outbox(10, t0()).expect("claim").is_empty());

        store.mark_outbox_sent(claimed[0].id, t0()).expect("sent");
        let row = store.get_outbox_row(claimed[0].id).unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Sent);

        // Sent rows never come back, the other row does after the lease.
        let later = t0() + OUTBOX_LEASE + Duration::seconds(1);
        let reclaimed = store.claim_due_outbox(10, later).expect("claim");
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, claimed[1].id);
    }

    #[test]
    fn test_retry_backoff_gate() {
        let store = store();
        let analysis = seed_analysis(&store);
        store
            .enqueue_analysis_emails(analysis, &["a@example.com".into()], t0())
            .unwrap();
        let claimed = store.claim_due_outbox(1, t0()).expect("claim");

        let retry_at = t0() + Duration::minutes(2);
        let attempts = store
            .mark_outbox_retry(claimed[0].id, retry_at, "connection refused", t0())
            .expect("retry");
        assert_eq!(attempts, 1);

        // Before the retry time: not claimable.
        assert!(store
            .claim_due_outbox(1, t0() + Duration::minutes(1))
            .unwrap()
            .is_empty());
        // After: claimable again.
        assert_eq!(
            store
                .claim_due_outbox(1, retry_at + Duration::seconds(1))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_terminal_states() {
        let store = store();
        let analysis = seed_analysis(&store);
        store
            .enqueue_analysis_emails(
                analysis,
                &["a@example.com".into(), "b@example.com".into()],
                t0(),
            )
            .unwrap();
        let claimed = store.claim_due_outbox(2, t0()).expect("claim");

        store
            .mark_outbox_failed(claimed[0].id, "550 no such user", t0())
            .unwrap();
        store
            .mark_outbox_dead(claimed[1].id, "attempts exhausted", t0())
            .unwrap();

        let later = t0() + OUTBOX_LEASE + Duration::hours(1);
        assert!(store.claim_due_outbox(10, later).unwrap().is_empty());
    }

    #[test]
    fn test_research_run_fan_out_unique_per_run() {
        let store = store();
        let g = store
            .insert_group("Pair", Some("deep"), None, true, t0())
            .expect("group");
        let (run_id, _) = store
            .insert_run_pending(g, QuarterYear::new(Quarter::Q3, 2026), t0())
            .expect("run");

        let list = vec!["a@example.com".to_string()];
        assert_eq!(store.enqueue_research_emails(run_id, &list, t0()).unwrap(), 1);
        assert_eq!(store.enqueue_research_emails(run_id, &list, t0()).unwrap(), 0);
    }
}
