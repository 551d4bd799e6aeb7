//! Group research coordinator: fan-in detection and article composition.
//!
//! Two-stage flow on one queue. An `Observe` message (analysis finished
//! for some group member) triggers the fan-in check; when every current
//! member has a completed analysis for the slot, a `pending` run row is
//! created and a `Run` message dispatched. The `Run` consumer claims the
//! row `pending -> in_progress`, composes the article from member
//! transcripts, and freezes the run at `done`. A periodic sweep catches
//! lost messages and error runs.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use crate::clock::Clock;
use crate::content_store::ContentStore;
use crate::extract::extract_text;
use crate::fiscal::{target_quarter, QuarterYear};
use crate::llm::{GenerateOptions, LlmClient, LlmError};
use crate::oracle::{OracleError, TranscriptOracle};
use crate::queue::{GroupResearchMsg, QueueMessage, QueueName};
use crate::retry::analysis_backoff;
use crate::store::types::{Group, RunStatus};
use crate::store::Store;

/// Idle poll interval when the queue is empty.
const IDLE_SLEEP_MS: u64 = 1000;

/// Periodic fan-in sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::seconds(300);

/// A pending run untouched this long gets its dispatch re-published.
const STALE_PENDING_AFTER: Duration = Duration::minutes(15);

/// Per-member transcript excerpt budget in the combined prompt.
const MEMBER_TEXT_BUDGET: usize = 12_000;

pub struct GroupResearchCoordinator {
    store: Store,
    oracle: Arc<dyn TranscriptOracle>,
    llm: Arc<dyn LlmClient>,
    content: ContentStore,
    options: GenerateOptions,
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
}

impl GroupResearchCoordinator {
    pub fn new(
        store: Store,
        oracle: Arc<dyn TranscriptOracle>,
        llm: Arc<dyn LlmClient>,
        content: ContentStore,
        options: GenerateOptions,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            oracle,
            llm,
            content,
            options,
            clock,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        log::info!("GroupResearch: started");
        let mut next_sweep = self.clock.now() + SWEEP_INTERVAL;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let now = self.clock.now();
            if now >= next_sweep {
                if let Err(e) = self.sweep(now) {
                    log::warn!("GroupResearch: sweep failed: {}", e);
                }
                next_sweep = now + SWEEP_INTERVAL;
            }

            let claimed = match self.store.claim(QueueName::GroupResearch, 1, now) {
                Ok(claimed) => claimed,
                Err(e) => {
                    log::warn!("GroupResearch: claim failed: {}", e);
                    Vec::new()
                }
            };

            let Some(message) = claimed.into_iter().next() else {
                tokio::time::sleep(std::time::Duration::from_millis(IDLE_SLEEP_MS)).await;
                continue;
            };

            if let Err(e) = self.process(&message).await {
                log::warn!("GroupResearch: message {} failed: {}", message.id, e);
            }
        }
        log::info!("GroupResearch: stopped");
    }

    /// Work one claimed group-research message to completion.
    pub async fn process(&self, message: &QueueMessage) -> Result<(), String> {
        let msg: GroupResearchMsg = message.decode().map_err(|e| e.to_string())?;
        match msg {
            GroupResearchMsg::Observe {
                equity_id,
                quarter,
                year,
            } => {
                let now = self.clock.now();
                self.observe(equity_id, QuarterYear::new(quarter, year), now)?;
                self.store.ack(message.id).map_err(|e| e.to_string())?;
            }
            GroupResearchMsg::Run {
                group_id,
                quarter,
                year,
                force,
            } => {
                self.execute_run(message, group_id, QuarterYear::new(quarter, year), force)
                    .await?;
            }
        }
        Ok(())
    }

    /// Fan-in check for every active research group containing the equity.
    fn observe(&self, equity_id: i64, slot: QuarterYear, now: DateTime<Utc>) -> Result<(), String> {
        for group in self
            .store
            .active_groups_for_equity(equity_id)
            .map_err(|e| e.to_string())?
        {
            if group
                .deep_research_prompt
                .as_deref()
                .map(str::is_empty)
                .unwrap_or(true)
            {
                continue;
            }
            self.consider_group_slot(&group, slot, now)?;
        }
        Ok(())
    }

    /// Dispatch a run for `(group, slot)` when fan-in holds and the slot
    /// has not already produced one. Error runs are re-opened; done and
    /// in-flight runs are left alone.
    fn consider_group_slot(
        &self,
        group: &Group,
        slot: QuarterYear,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let missing = self
            .store
            .members_missing_analysis(group.id, slot)
            .map_err(|e| e.to_string())?;
        if !missing.is_empty() {
            log::debug!(
                "GroupResearch: group {} not ready for {} ({} members missing)",
                group.name,
                slot,
                missing.len()
            );
            return Ok(());
        }

        let existing = self
            .store
            .get_run_for_slot(group.id, slot)
            .map_err(|e| e.to_string())?;
        let run_id = match existing {
            None => {
                let (run_id, created) = self
                    .store
                    .insert_run_pending(group.id, slot, now)
                    .map_err(|e| e.to_string())?;
                if !created {
                    return Ok(());
                }
                run_id
            }
            Some(run) if run.status == RunStatus::Error => {
                self.store
                    .reopen_run_pending(group.id, slot, now)
                    .map_err(|e| e.to_string())?
            }
            Some(_) => return Ok(()),
        };

        log::info!(
            "GroupResearch: group '{}' ready for {}, dispatching run {}",
            group.name,
            slot,
            run_id
        );
        self.publish_run(group.id, slot, false, now)
    }

    fn publish_run(
        &self,
        group_id: i64,
        slot: QuarterYear,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let msg = GroupResearchMsg::Run {
            group_id,
            quarter: slot.quarter,
            year: slot.year,
            force,
        };
        self.store
            .publish(QueueName::GroupResearch, &msg, Duration::zero(), now)
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Second stage: claim the run row and compose the article.
    async fn execute_run(
        &self,
        message: &QueueMessage,
        group_id: i64,
        slot: QuarterYear,
        force: bool,
    ) -> Result<(), String> {
        let now = self.clock.now();
        let Some(group) = self.store.get_group(group_id).map_err(|e| e.to_string())? else {
            self.store.ack(message.id).map_err(|e| e.to_string())?;
            return Ok(());
        };

        let run_id = match self
            .store
            .get_run_for_slot(group_id, slot)
            .map_err(|e| e.to_string())?
        {
            Some(run) => run.id,
            None => {
                self.store.ack(message.id).map_err(|e| e.to_string())?;
                return Ok(());
            }
        };

        if !self
            .store
            .claim_run(run_id, force, now)
            .map_err(|e| e.to_string())?
        {
            // Not pending (or an in-flight holder): someone else has it.
            self.store.ack(message.id).map_err(|e| e.to_string())?;
            return Ok(());
        }

        match self.compose(&group, run_id, slot, force).await {
            Ok(()) => {
                self.store.ack(message.id).map_err(|e| e.to_string())?;
            }
            Err(RunFailure::Permanent(reason)) => {
                let now = self.clock.now();
                self.store
                    .fail_run(run_id, &reason, now)
                    .map_err(|e| e.to_string())?;
                self.store.ack(message.id).map_err(|e| e.to_string())?;
                log::warn!("GroupResearch: run {} failed: {}", run_id, reason);
            }
            Err(RunFailure::Transient(reason)) => {
                let now = self.clock.now();
                self.store
                    .release_run(run_id, now)
                    .map_err(|e| e.to_string())?;
                let backoff = analysis_backoff(message.attempts.max(0) as u32);
                self.store
                    .nack(message.id, backoff, &reason, now)
                    .map_err(|e| e.to_string())?;
                log::warn!(
                    "GroupResearch: run {} hit transient failure, retrying: {}",
                    run_id,
                    reason
                );
            }
        }
        Ok(())
    }

    async fn compose(
        &self,
        group: &Group,
        run_id: i64,
        slot: QuarterYear,
        force: bool,
    ) -> Result<(), RunFailure> {
        let system_prompt = group
            .deep_research_prompt
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                RunFailure::Permanent("no deep research prompt configured for this group".into())
            })?;

        let members = self
            .store
            .group_members(group.id)
            .map_err(|e| RunFailure::Transient(e.to_string()))?;
        if members.is_empty() {
            return Err(RunFailure::Permanent("group has no members".into()));
        }

        // Fan-in must still hold at dispatch; force omits the missing.
        let mut parts: Vec<String> = Vec::new();
        let mut included: Vec<String> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();
        for member in &members {
            let symbol = member
                .oracle_symbol()
                .unwrap_or(&member.identifier)
                .to_string();
            let transcript = self
                .store
                .get_transcript_for_slot(member.id, slot)
                .map_err(|e| RunFailure::Transient(e.to_string()))?
                .filter(|t| t.status == crate::store::types::TranscriptStatus::Available);

            let Some(transcript) = transcript else {
                if force {
                    skipped.push(symbol);
                    continue;
                }
                return Err(RunFailure::Permanent(format!(
                    "missing transcript for {}",
                    symbol
                )));
            };
            let Some(source_url) = transcript.source_url.clone() else {
                if force {
                    skipped.push(symbol);
                    continue;
                }
                return Err(RunFailure::Permanent(format!(
                    "missing transcript URL for {}",
                    symbol
                )));
            };

            let text = match self.member_text(transcript.id, &source_url).await {
                Ok(text) => text,
                Err(RunFailure::Permanent(reason)) if force => {
                    log::warn!(
                        "GroupResearch: skipping {} in forced run {}: {}",
                        symbol,
                        run_id,
                        reason
                    );
                    skipped.push(symbol);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let excerpt: String = text.chars().take(MEMBER_TEXT_BUDGET).collect();
            parts.push(format!(
                "### {} - {} ({})\n\n{}",
                symbol, member.name, slot, excerpt
            ));
            included.push(symbol);
        }

        if parts.is_empty() {
            return Err(RunFailure::Permanent(
                "no member transcripts could be processed".into(),
            ));
        }

        let user_prompt = format!(
            "You are analyzing group '{}' for {}. Use the context below (all group \
             member transcripts) to deliver a comparative deep research article. \
             Highlight cross-company themes, divergences, risks, and opportunities.{}",
            group.name,
            slot,
            group
                .stock_summary_prompt
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(|p| format!(
                    "\n\nAdditional instructions for summarising each company:\n{}",
                    p
                ))
                .unwrap_or_default()
        );
        let input = format!("{}\n\n{}", user_prompt, parts.join("\n\n"));

        let response = self
            .llm
            .generate(&system_prompt, &input, &self.options)
            .await
            .map_err(|e| match e {
                LlmError::Permanent(reason) => {
                    RunFailure::Permanent(format!("generation failed: {}", reason))
                }
                other => RunFailure::Transient(other.to_string()),
            })?;

        let now = self.clock.now();
        let model = self.llm.model_ref();
        let skipped_note = if skipped.is_empty() {
            None
        } else {
            Some(skipped.join(", "))
        };
        self.store
            .complete_run(
                run_id,
                &system_prompt,
                &response.output_text,
                &model.provider,
                &model.model_id,
                model.revision.as_deref(),
                skipped_note.as_deref(),
                now,
            )
            .map_err(|e| RunFailure::Transient(e.to_string()))?;

        log::info!(
            "GroupResearch: run {} done for '{}' {} ({} members, {} skipped)",
            run_id,
            group.name,
            slot,
            included.len(),
            skipped.len()
        );

        // Article email fan-out happens after the run is durably done.
        let recipients = self
            .store
            .active_recipients()
            .map_err(|e| RunFailure::Transient(e.to_string()))?;
        if !recipients.is_empty() {
            self.store
                .enqueue_research_emails(run_id, &recipients, now)
                .map_err(|e| RunFailure::Transient(e.to_string()))?;
        }
        Ok(())
    }

    /// Extracted member transcript text, via the shared content cache.
    async fn member_text(&self, transcript_id: i64, source_url: &str) -> Result<String, RunFailure> {
        if let Some(cached) = self.content.load(transcript_id, source_url) {
            return Ok(cached);
        }
        let bytes = self
            .oracle
            .download(source_url)
            .await
            .map_err(|e| match e {
                OracleError::Permanent(reason) => RunFailure::Permanent(reason),
                other => RunFailure::Transient(other.to_string()),
            })?;
        let text = extract_text(&bytes)
            .map_err(|e| RunFailure::Permanent(format!("extraction failed: {}", e)))?;
        self.content
            .save(transcript_id, source_url, &text)
            .map_err(|e| RunFailure::Transient(e.to_string()))?;
        Ok(text)
    }

    /// Periodic reconciliation: skipped while a watchlist poll wave is in
    /// flight (results are still landing); otherwise re-checks fan-in for
    /// every research group and re-publishes stale pending runs.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<(), String> {
        let target = target_quarter(now);
        if self
            .store
            .schedule_wave_in_flight(target, now)
            .map_err(|e| e.to_string())?
        {
            log::debug!("GroupResearch: sweep deferred, poll wave in flight");
            return Ok(());
        }

        for group in self
            .store
            .active_research_groups()
            .map_err(|e| e.to_string())?
        {
            for slot in self
                .store
                .group_ready_slots(group.id)
                .map_err(|e| e.to_string())?
            {
                self.consider_group_slot(&group, slot, now)?;
            }
        }

        for run in self
            .store
            .stale_pending_runs(now - STALE_PENDING_AFTER)
            .map_err(|e| e.to_string())?
        {
            log::info!(
                "GroupResearch: re-dispatching stale pending run {} (group {}, {} FY{})",
                run.id,
                run.group_id,
                run.quarter,
                run.year
            );
            self.publish_run(
                run.group_id,
                QuarterYear::new(run.quarter, run.year),
                false,
                now,
            )?;
        }
        Ok(())
    }
}

/// Failure classification for one run attempt.
enum RunFailure {
    Transient(String),
    Permanent(String),
}
