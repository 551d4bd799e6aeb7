//! Email worker pool: drains the outbox over SMTP.
//!
//! Outbox rows are claimed with a lease like queue messages; send results
//! translate straight into row state. A row references either a
//! transcript analysis or a group research run and renders accordingly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::clock::Clock;
use crate::mailer::{
    render_analysis_email, render_group_article_email, AnalysisEmail, EmailMessage,
    GroupArticleEmail, MailError, Mailer,
};
use crate::retry::{email_backoff, ErrorClass, EMAIL_MAX_ATTEMPTS};
use crate::store::types::OutboxRow;
use crate::store::Store;

/// Rows claimed per pass.
const CLAIM_BATCH: usize = 5;

/// Idle poll interval when nothing is sendable.
const IDLE_SLEEP_MS: u64 = 1000;

pub struct EmailWorker {
    id: usize,
    store: Store,
    mailer: Arc<dyn Mailer>,
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
}

impl EmailWorker {
    pub fn new(
        id: usize,
        store: Store,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            store,
            mailer,
            clock,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        log::info!("EmailWorker[{}]: started", self.id);
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let now = self.clock.now();
            let claimed = match self.store.claim_due_outbox(CLAIM_BATCH, now) {
                Ok(claimed) => claimed,
                Err(e) => {
                    log::warn!("EmailWorker[{}]: claim failed: {}", self.id, e);
                    Vec::new()
                }
            };

            if claimed.is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(IDLE_SLEEP_MS)).await;
                continue;
            }

            for row in claimed {
                if *self.shutdown.borrow() {
                    // Stop claiming; the lease lets another process finish.
                    break;
                }
                if let Err(e) = self.send_row(&row).await {
                    log::warn!("EmailWorker[{}]: outbox row {} failed: {}", self.id, row.id, e);
                }
            }
        }
        log::info!("EmailWorker[{}]: stopped", self.id);
    }

    /// Send one claimed outbox row.
    pub async fn send_row(&self, row: &OutboxRow) -> Result<(), String> {
        let now = self.clock.now();
        let message = match self.render(row, now)? {
            Some(message) => message,
            None => {
                // The referenced analysis/run is gone: permanent.
                self.store
                    .mark_outbox_failed(row.id, "referenced content missing", now)
                    .map_err(|e| e.to_string())?;
                return Ok(());
            }
        };

        match self.mailer.send(&message).await {
            Ok(()) => {
                let now = self.clock.now();
                self.store
                    .mark_outbox_sent(row.id, now)
                    .map_err(|e| e.to_string())?;
                log::info!(
                    "EmailWorker[{}]: sent '{}' to {}",
                    self.id,
                    message.subject,
                    message.to
                );
            }
            Err(e) if e.class() == ErrorClass::Permanent => {
                let now = self.clock.now();
                self.store
                    .mark_outbox_failed(row.id, &e.to_string(), now)
                    .map_err(|err| err.to_string())?;
                log::warn!(
                    "EmailWorker[{}]: permanent send failure to {}: {}",
                    self.id,
                    message.to,
                    e
                );
            }
            Err(e) => {
                self.handle_transient(row, &e)?;
            }
        }
        Ok(())
    }

    fn handle_transient(&self, row: &OutboxRow, error: &MailError) -> Result<(), String> {
        let now = self.clock.now();
        let next_attempts = row.attempts + 1;
        if next_attempts as u32 >= EMAIL_MAX_ATTEMPTS {
            self.store
                .mark_outbox_dead(row.id, &error.to_string(), now)
                .map_err(|e| e.to_string())?;
            log::warn!(
                "EmailWorker[{}]: outbox row {} dead after {} attempts",
                self.id,
                row.id,
                next_attempts
            );
        } else {
            let retry_at = now + email_backoff(next_attempts as u32);
            self.store
                .mark_outbox_retry(row.id, retry_at, &error.to_string(), now)
                .map_err(|e| e.to_string())?;
            log::warn!(
                "EmailWorker[{}]: transient send failure on row {} (attempt {}): {}",
                self.id,
                row.id,
                next_attempts,
                error
            );
        }
        Ok(())
    }

    /// Assemble the email for an outbox row from durable state. Returns
    /// `None` when the referenced content no longer exists.
    fn render(
        &self,
        row: &OutboxRow,
        now: DateTime<Utc>,
    ) -> Result<Option<EmailMessage>, String> {
        if let Some(analysis_id) = row.analysis_id {
            let Some(analysis) = self
                .store
                .get_analysis(analysis_id)
                .map_err(|e| e.to_string())?
            else {
                return Ok(None);
            };
            let Some(transcript) = self
                .store
                .get_transcript(analysis.transcript_id)
                .map_err(|e| e.to_string())?
            else {
                return Ok(None);
            };
            let Some(equity) = self
                .store
                .get_equity(transcript.equity_id)
                .map_err(|e| e.to_string())?
            else {
                return Ok(None);
            };

            let symbol = equity.oracle_symbol().unwrap_or(&equity.identifier);
            return Ok(Some(render_analysis_email(&AnalysisEmail {
                recipient: &row.recipient,
                equity_symbol: symbol,
                equity_name: &equity.name,
                quarter: transcript.quarter.as_str(),
                year: transcript.year,
                output_markdown: &analysis.output_text,
                model_name: &analysis.model_id,
                transcript_url: transcript.source_url.as_deref().unwrap_or("#"),
                generated_at: now,
            })));
        }

        if let Some(run_id) = row.research_run_id {
            let Some(run) = self.store.get_run(run_id).map_err(|e| e.to_string())? else {
                return Ok(None);
            };
            let Some(group) = self
                .store
                .get_group(run.group_id)
                .map_err(|e| e.to_string())?
            else {
                return Ok(None);
            };
            let Some(output) = run.output_text.as_deref() else {
                return Ok(None);
            };
            let members = self
                .store
                .group_members(run.group_id)
                .map_err(|e| e.to_string())?;
            let equity_list = members
                .iter()
                .map(|m| m.oracle_symbol().unwrap_or(&m.identifier).to_string())
                .collect::<Vec<_>>()
                .join(", ");

            return Ok(Some(render_group_article_email(&GroupArticleEmail {
                recipient: &row.recipient,
                group_name: &group.name,
                quarter: run.quarter.as_str(),
                year: run.year,
                equity_list: &equity_list,
                output_markdown: output,
                model_name: run.model_id.as_deref().unwrap_or("unknown"),
                generated_at: now,
            })));
        }

        Ok(None)
    }
}
