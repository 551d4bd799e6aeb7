//! Analysis worker pool: turns `analysis_request` messages into
//! `transcript_analyses` rows, outbox fan-out, and group-research
//! observations.
//!
//! The per-transcript reservation (`Transcript.analysis_status` CAS)
//! guarantees at most one in-flight analysis per transcript regardless of
//! queue width. The provider call runs with no store transaction open.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use crate::clock::Clock;
use crate::content_store::ContentStore;
use crate::extract::extract_text;
use crate::llm::{GenerateOptions, LlmClient, LlmError};
use crate::oracle::{OracleError, TranscriptOracle};
use crate::queue::{AnalysisRequestMsg, GroupResearchMsg, QueueMessage, QueueName};
use crate::retry::{analysis_backoff, ANALYSIS_MAX_ATTEMPTS};
use crate::store::types::{AnalysisJob, Transcript, TranscriptStatus};
use crate::store::Store;

/// Idle poll interval when the queue is empty.
const IDLE_SLEEP_MS: u64 = 1000;

/// Bounded wait for the reservation when forcing past a live holder.
const FORCE_RESERVE_RETRIES: u32 = 3;
const FORCE_RESERVE_WAIT_MS: u64 = 2000;

pub struct AnalysisWorker {
    id: usize,
    store: Store,
    oracle: Arc<dyn TranscriptOracle>,
    llm: Arc<dyn LlmClient>,
    content: ContentStore,
    default_prompt: String,
    options: GenerateOptions,
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
}

impl AnalysisWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        store: Store,
        oracle: Arc<dyn TranscriptOracle>,
        llm: Arc<dyn LlmClient>,
        content: ContentStore,
        default_prompt: String,
        options: GenerateOptions,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            store,
            oracle,
            llm,
            content,
            default_prompt,
            options,
            clock,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        log::info!("AnalysisWorker[{}]: started", self.id);
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let now = self.clock.now();
            let claimed = match self.store.claim(QueueName::AnalysisRequest, 1, now) {
                Ok(claimed) => claimed,
                Err(e) => {
                    log::warn!("AnalysisWorker[{}]: claim failed: {}", self.id, e);
                    Vec::new()
                }
            };

            let Some(message) = claimed.into_iter().next() else {
                tokio::time::sleep(std::time::Duration::from_millis(IDLE_SLEEP_MS)).await;
                continue;
            };

            if let Err(e) = self.process(&message).await {
                log::warn!(
                    "AnalysisWorker[{}]: message {} failed: {}",
                    self.id,
                    message.id,
                    e
                );
            }
        }
        log::info!("AnalysisWorker[{}]: stopped", self.id);
    }

    /// Work one claimed `analysis_request` message to completion.
    pub async fn process(&self, message: &QueueMessage) -> Result<(), String> {
        let request: AnalysisRequestMsg = message.decode().map_err(|e| e.to_string())?;
        let now = self.clock.now();

        let Some(job) = self
            .store
            .begin_analysis_job(request.job_id, now)
            .map_err(|e| e.to_string())?
        else {
            // Terminal job: nothing to do.
            self.store.ack(message.id).map_err(|e| e.to_string())?;
            return Ok(());
        };

        let Some(transcript) = self
            .store
            .get_transcript(job.transcript_id)
            .map_err(|e| e.to_string())?
        else {
            self.store
                .fail_analysis_job(job.id, "transcript not found", now)
                .map_err(|e| e.to_string())?;
            self.store.ack(message.id).map_err(|e| e.to_string())?;
            return Ok(());
        };

        if transcript.status != TranscriptStatus::Available || transcript.source_url.is_none() {
            self.store
                .fail_analysis_job(job.id, "transcript not available for analysis", now)
                .map_err(|e| e.to_string())?;
            self.store.ack(message.id).map_err(|e| e.to_string())?;
            return Ok(());
        }

        // At-most-one per transcript: take the reservation or stand down.
        if !self.reserve(&job, transcript.id).await? {
            let now = self.clock.now();
            if self
                .store
                .count_analyses_for(transcript.id)
                .map_err(|e| e.to_string())?
                > 0
                && !job.force
            {
                // Someone already finished the work.
                self.store
                    .complete_analysis_job(job.id, now)
                    .map_err(|e| e.to_string())?;
                self.store.ack(message.id).map_err(|e| e.to_string())?;
                return Ok(());
            }
            let retry_at = now + Duration::seconds(60);
            self.store
                .retry_analysis_job(job.id, retry_at, "transcript reservation held", now)
                .map_err(|e| e.to_string())?;
            if job.force {
                self.store
                    .nack(message.id, Duration::seconds(30), "reservation held", now)
                    .map_err(|e| e.to_string())?;
            } else {
                self.store.ack(message.id).map_err(|e| e.to_string())?;
            }
            return Ok(());
        }

        match self.analyse(&job, &transcript, &request.source_url).await {
            Ok(analysis_id) => {
                let now = self.clock.now();
                self.store.ack(message.id).map_err(|e| e.to_string())?;
                self.fan_out(&transcript, analysis_id, now)?;
            }
            Err(failure) => self.handle_failure(&job, &transcript, message, failure)?,
        }
        Ok(())
    }

    async fn reserve(&self, job: &AnalysisJob, transcript_id: i64) -> Result<bool, String> {
        let now = self.clock.now();
        if self
            .store
            .try_reserve_analysis(transcript_id, now)
            .map_err(|e| e.to_string())?
        {
            return Ok(true);
        }
        if !job.force {
            return Ok(false);
        }
        // Force waits briefly for the holder to clear.
        for _ in 0..FORCE_RESERVE_RETRIES {
            tokio::time::sleep(std::time::Duration::from_millis(FORCE_RESERVE_WAIT_MS)).await;
            let now = self.clock.now();
            if self
                .store
                .try_reserve_analysis(transcript_id, now)
                .map_err(|e| e.to_string())?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The long middle: download/extract (cached), resolve the prompt,
    /// call the provider, commit the analysis. No store transaction is
    /// held across the awaits.
    async fn analyse(
        &self,
        job: &AnalysisJob,
        transcript: &Transcript,
        source_url: &str,
    ) -> Result<i64, Failure> {
        let text = match self.content.load(transcript.id, source_url) {
            Some(cached) => cached,
            None => {
                let bytes = self
                    .oracle
                    .download(source_url)
                    .await
                    .map_err(Failure::from_oracle)?;
                let text = extract_text(&bytes)
                    .map_err(|e| Failure::Permanent(format!("extraction failed: {}", e)))?;
                let path = self
                    .content
                    .save(transcript.id, source_url, &text)
                    .map_err(|e| Failure::Transient(e.to_string()))?;
                let now = self.clock.now();
                self.store
                    .set_content_path(transcript.id, &path.to_string_lossy(), now)
                    .map_err(|e| Failure::Transient(e.to_string()))?;
                text
            }
        };

        let prompt = self
            .store
            .stock_summary_prompt_for(transcript.equity_id)
            .map_err(|e| Failure::Transient(e.to_string()))?
            .unwrap_or_else(|| self.default_prompt.clone());

        let input = format!("Here is the transcript text:\n\n{}", text);
        let response = self
            .llm
            .generate(&prompt, &input, &self.options)
            .await
            .map_err(Failure::from_llm)?;

        let now = self.clock.now();
        let model = self.llm.model_ref();
        let analysis_id = self
            .store
            .insert_analysis(
                transcript.id,
                &prompt,
                &response.output_text,
                &model.provider,
                &model.model_id,
                model.revision.as_deref(),
                response.tokens_in,
                response.tokens_out,
                response.cost,
                now,
            )
            .map_err(|e| Failure::Transient(e.to_string()))?;
        self.store
            .mark_analysis_done(transcript.id, now)
            .map_err(|e| Failure::Transient(e.to_string()))?;
        self.store
            .complete_analysis_job(job.id, now)
            .map_err(|e| Failure::Transient(e.to_string()))?;

        log::info!(
            "AnalysisWorker[{}]: analysed transcript {} ({} in / {} out tokens, ${:.4})",
            self.id,
            transcript.id,
            response.tokens_in,
            response.tokens_out,
            response.cost
        );
        Ok(analysis_id)
    }

    /// Post-commit side effects: email fan-out for watchlisted equities
    /// and the group-research observation. The analysis row is already
    /// durable when these run.
    fn fan_out(
        &self,
        transcript: &Transcript,
        analysis_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if self
            .store
            .is_on_watchlist(transcript.equity_id)
            .map_err(|e| e.to_string())?
        {
            let recipients = self.store.active_recipients().map_err(|e| e.to_string())?;
            if !recipients.is_empty() {
                let created = self
                    .store
                    .enqueue_analysis_emails(analysis_id, &recipients, now)
                    .map_err(|e| e.to_string())?;
                if created > 0 {
                    log::info!(
                        "AnalysisWorker[{}]: queued {} notification emails for analysis {}",
                        self.id,
                        created,
                        analysis_id
                    );
                }
            }
        }

        if self
            .store
            .in_active_group(transcript.equity_id)
            .map_err(|e| e.to_string())?
        {
            let msg = GroupResearchMsg::Observe {
                equity_id: transcript.equity_id,
                quarter: transcript.quarter,
                year: transcript.year,
            };
            self.store
                .publish(QueueName::GroupResearch, &msg, Duration::zero(), now)
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn handle_failure(
        &self,
        job: &AnalysisJob,
        transcript: &Transcript,
        message: &QueueMessage,
        failure: Failure,
    ) -> Result<(), String> {
        let now = self.clock.now();
        match failure {
            Failure::Permanent(reason) => {
                log::warn!(
                    "AnalysisWorker[{}]: permanent failure on transcript {}: {}",
                    self.id,
                    transcript.id,
                    reason
                );
                self.store
                    .mark_analysis_error(transcript.id, &reason, now)
                    .map_err(|e| e.to_string())?;
                self.store
                    .fail_analysis_job(job.id, &reason, now)
                    .map_err(|e| e.to_string())?;
                self.store.ack(message.id).map_err(|e| e.to_string())?;
            }
            Failure::Transient(reason) => {
                self.store
                    .release_analysis_reservation(transcript.id, now)
                    .map_err(|e| e.to_string())?;
                let next_attempts = job.attempts + 1;
                if next_attempts as u32 >= ANALYSIS_MAX_ATTEMPTS {
                    log::warn!(
                        "AnalysisWorker[{}]: job {} dead after {} attempts: {}",
                        self.id,
                        job.id,
                        next_attempts,
                        reason
                    );
                    self.store
                        .kill_analysis_job(job.id, &reason, now)
                        .map_err(|e| e.to_string())?;
                    self.store
                        .mark_analysis_error(transcript.id, &reason, now)
                        .map_err(|e| e.to_string())?;
                    self.store.ack(message.id).map_err(|e| e.to_string())?;
                } else {
                    let backoff = analysis_backoff(next_attempts as u32);
                    self.store
                        .retry_analysis_job(job.id, now + backoff, &reason, now)
                        .map_err(|e| e.to_string())?;
                    self.store
                        .nack(message.id, backoff, &reason, now)
                        .map_err(|e| e.to_string())?;
                    log::warn!(
                        "AnalysisWorker[{}]: transient failure on job {} (attempt {}): {}",
                        self.id,
                        job.id,
                        next_attempts,
                        reason
                    );
                }
            }
        }
        Ok(())
    }
}

/// Internal failure classification for one analysis attempt.
enum Failure {
    Transient(String),
    Permanent(String),
}

impl Failure {
    fn from_oracle(e: OracleError) -> Self {
        match e {
            OracleError::RateLimited => Failure::Transient(e.to_string()),
            OracleError::Transient(reason) => Failure::Transient(reason),
            OracleError::Permanent(reason) => Failure::Permanent(reason),
        }
    }

    fn from_llm(e: LlmError) -> Self {
        match e {
            LlmError::RateLimited => Failure::Transient(e.to_string()),
            LlmError::Transient(reason) => Failure::Transient(reason),
            LlmError::Permanent(reason) => Failure::Permanent(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fiscal::{Quarter, QuarterYear};
    use crate::llm::{LlmResponse, ModelRef};
    use crate::store::test_support::{seed_equity, store, t0};
    use crate::store::types::{AnalysisStatus, Equity, JobStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubOracle {
        body: Vec<u8>,
        fail: bool,
    }

    #[async_trait]
    impl TranscriptOracle for StubOracle {
        async fn check(
            &self,
            _equity: &Equity,
            _slot: QuarterYear,
        ) -> Result<crate::oracle::OracleStatus, OracleError> {
            Ok(crate::oracle::OracleStatus::None)
        }

        async fn download(&self, _source_url: &str) -> Result<Vec<u8>, OracleError> {
            if self.fail {
                Err(OracleError::Transient("download failed".into()))
            } else {
                Ok(self.body.clone())
            }
        }
    }

    struct StubLlm {
        model: ModelRef,
        calls: AtomicUsize,
        responses: Mutex<Vec<Result<LlmResponse, LlmError>>>,
        seen_prompts: Mutex<Vec<String>>,
    }

    impl StubLlm {
        fn ok(output: &str) -> Arc<Self> {
            Self::scripted(vec![Ok(LlmResponse {
                output_text: output.to_string(),
                tokens_in: 1000,
                tokens_out: 200,
                cost: 0.0123,
            })])
        }

        fn scripted(mut responses: Vec<Result<LlmResponse, LlmError>>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                model: ModelRef {
                    provider: "anthropic".into(),
                    model_id: "claude-sonnet-4-5".into(),
                    revision: None,
                },
                calls: AtomicUsize::new(0),
                responses: Mutex::new(responses),
                seen_prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn generate(
            &self,
            system_prompt: &str,
            _input_text: &str,
            _options: &GenerateOptions,
        ) -> Result<LlmResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_prompts
                .lock()
                .expect("prompt lock")
                .push(system_prompt.to_string());
            self.responses
                .lock()
                .expect("script lock")
                .pop()
                .unwrap_or(Err(LlmError::Permanent("script exhausted".into())))
        }

        fn model_ref(&self) -> &ModelRef {
            &self.model
        }
    }

    fn slot() -> QuarterYear {
        QuarterYear::new(Quarter::Q3, 2026)
    }

    fn transcript_body() -> Vec<u8> {
        format!(
            "Q3 FY26 earnings call\n{}",
            "management commentary on the quarter. ".repeat(20)
        )
        .into_bytes()
    }

    struct Fixture {
        worker: AnalysisWorker,
        transcript_id: i64,
        message: QueueMessage,
    }

    fn options() -> GenerateOptions {
        GenerateOptions {
            max_output_tokens: 8000,
            thinking_enabled: false,
            thinking_budget: 0,
        }
    }

    /// Seed a watchlisted equity with an available transcript, a recipient,
    /// an enqueued job, and a claimed analysis_request message.
    fn fixture(llm: Arc<dyn LlmClient>, download_fails: bool) -> Fixture {
        let s = store();
        let e = seed_equity(&s, "INE-A", "ALPHA");
        s.add_to_watchlist(e, t0()).unwrap();
        s.add_recipient("alice@example.com", true, t0()).unwrap();
        let (transcript_id, _, _) = s
            .upsert_available(e, slot(), "https://x.example/a.pdf", None, t0())
            .unwrap();
        let job = s
            .enqueue_analysis_job(transcript_id, false, t0())
            .unwrap()
            .job()
            .unwrap()
            .clone();
        s.publish(
            QueueName::AnalysisRequest,
            &AnalysisRequestMsg {
                job_id: job.id,
                transcript_id,
                source_url: "https://x.example/a.pdf".into(),
                force: false,
            },
            Duration::zero(),
            t0(),
        )
        .unwrap();
        let message = s
            .claim(QueueName::AnalysisRequest, 1, t0())
            .unwrap()
            .into_iter()
            .next()
            .unwrap();

        let content_dir = tempfile::tempdir().expect("tempdir");
        let content = ContentStore::open(content_dir.path().join("content")).unwrap();
        std::mem::forget(content_dir);

        let (_tx, rx) = watch::channel(false);
        let worker = AnalysisWorker::new(
            0,
            s,
            Arc::new(StubOracle {
                body: transcript_body(),
                fail: download_fails,
            }),
            llm,
            content,
            "default analyst prompt".into(),
            options(),
            Arc::new(ManualClock::new(t0())),
            rx,
        );
        Fixture {
            worker,
            transcript_id,
            message,
        }
    }

    #[tokio::test]
    async fn test_happy_path_commits_analysis_and_fans_out() {
        let llm = StubLlm::ok("**Strong** quarter.");
        let fx = fixture(llm.clone(), false);
        fx.worker.process(&fx.message).await.expect("process");

        let s = &fx.worker.store;
        let analysis = s.latest_analysis_for(fx.transcript_id).unwrap().unwrap();
        assert_eq!(analysis.output_text, "**Strong** quarter.");
        assert_eq!(analysis.tokens_in, 1000);
        assert_eq!(analysis.model_provider, "anthropic");

        let transcript = s.get_transcript(fx.transcript_id).unwrap().unwrap();
        assert_eq!(transcript.analysis_status, Some(AnalysisStatus::Done));
        assert!(transcript.content_path.is_some());

        // One outbox row for the active recipient.
        let outbox = s.claim_due_outbox(10, t0()).unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].recipient, "alice@example.com");

        // Group observation only fires for grouped equities.
        assert_eq!(s.queue_len(QueueName::GroupResearch).unwrap(), 0);
        assert_eq!(s.queue_len(QueueName::AnalysisRequest).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_group_member_emits_observation() {
        let llm = StubLlm::ok("output");
        let fx = fixture(llm, false);
        let s = &fx.worker.store;
        let g = s.insert_group("G", Some("deep"), None, true, t0()).unwrap();
        let equity_id = s.get_transcript(fx.transcript_id).unwrap().unwrap().equity_id;
        s.add_group_member(g, equity_id, t0()).unwrap();

        fx.worker.process(&fx.message).await.expect("process");

        let observations = fx
            .worker
            .store
            .claim(QueueName::GroupResearch, 10, t0())
            .unwrap();
        assert_eq!(observations.len(), 1);
        match observations[0].decode::<GroupResearchMsg>().unwrap() {
            GroupResearchMsg::Observe { equity_id: seen, .. } => assert_eq!(seen, equity_id),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_group_prompt_override_used() {
        let llm = StubLlm::ok("output");
        let fx = fixture(llm.clone(), false);
        let s = &fx.worker.store;
        let g = s
            .insert_group("G", Some("deep"), Some("group summary prompt"), true, t0())
            .unwrap();
        let equity_id = s.get_transcript(fx.transcript_id).unwrap().unwrap().equity_id;
        s.add_group_member(g, equity_id, t0()).unwrap();

        fx.worker.process(&fx.message).await.expect("process");

        let prompts = llm.seen_prompts.lock().unwrap();
        assert_eq!(prompts.as_slice(), ["group summary prompt"]);
    }

    #[tokio::test]
    async fn test_transient_llm_failure_schedules_retry() {
        let llm = StubLlm::scripted(vec![Err(LlmError::Transient("503".into()))]);
        let fx = fixture(llm, false);
        fx.worker.process(&fx.message).await.expect("process");

        let s = &fx.worker.store;
        let job = s.get_analysis_job(fx.message.decode::<AnalysisRequestMsg>().unwrap().job_id)
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        // First retry lands 60 s out.
        assert_eq!(job.retry_next_at, Some(t0() + Duration::seconds(60)));

        // Reservation released for the retry.
        let transcript = s.get_transcript(fx.transcript_id).unwrap().unwrap();
        assert_eq!(transcript.analysis_status, None);

        // Message redelivered after the backoff, not before.
        assert!(s.claim(QueueName::AnalysisRequest, 1, t0()).unwrap().is_empty());
        assert_eq!(
            s.claim(QueueName::AnalysisRequest, 1, t0() + Duration::seconds(60))
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_permanent_llm_failure_records_error() {
        let llm = StubLlm::scripted(vec![Err(LlmError::Permanent("bad prompt".into()))]);
        let fx = fixture(llm, false);
        fx.worker.process(&fx.message).await.expect("process");

        let s = &fx.worker.store;
        let transcript = s.get_transcript(fx.transcript_id).unwrap().unwrap();
        assert_eq!(transcript.analysis_status, Some(AnalysisStatus::Error));
        assert_eq!(transcript.analysis_error.as_deref(), Some("bad prompt"));

        let job_id = fx.message.decode::<AnalysisRequestMsg>().unwrap().job_id;
        let job = s.get_analysis_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(s.queue_len(QueueName::AnalysisRequest).unwrap(), 0);
        assert!(s.latest_analysis_for(fx.transcript_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attempt_exhaustion_kills_job() {
        let llm = StubLlm::scripted(vec![Err(LlmError::Transient("503".into()))]);
        let fx = fixture(llm, false);

        // Push the job to the brink of the ceiling first.
        let job_id = fx.message.decode::<AnalysisRequestMsg>().unwrap().job_id;
        for _ in 0..(ANALYSIS_MAX_ATTEMPTS - 1) {
            fx.worker
                .store
                .retry_analysis_job(job_id, t0(), "earlier failure", t0())
                .unwrap();
        }

        fx.worker.process(&fx.message).await.expect("process");

        let s = &fx.worker.store;
        let job = s.get_analysis_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Dead);
        let transcript = s.get_transcript(fx.transcript_id).unwrap().unwrap();
        assert_eq!(transcript.analysis_status, Some(AnalysisStatus::Error));
        assert_eq!(s.queue_len(QueueName::AnalysisRequest).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_download_failure_is_transient() {
        let llm = StubLlm::ok("never reached");
        let fx = fixture(llm.clone(), true);
        fx.worker.process(&fx.message).await.expect("process");

        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        let job_id = fx.message.decode::<AnalysisRequestMsg>().unwrap().job_id;
        let job = fx.worker.store.get_analysis_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_reservation_contention_without_force_stands_down() {
        let llm = StubLlm::ok("never reached");
        let fx = fixture(llm.clone(), false);

        // Another worker holds the transcript.
        fx.worker
            .store
            .try_reserve_analysis(fx.transcript_id, t0())
            .unwrap();

        fx.worker.process(&fx.message).await.expect("process");

        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        let job_id = fx.message.decode::<AnalysisRequestMsg>().unwrap().job_id;
        let job = fx.worker.store.get_analysis_job(job_id).unwrap().unwrap();
        // Handed back to the sweep for a later retry; message acked.
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(
            fx.worker.store.queue_len(QueueName::AnalysisRequest).unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_second_run_uses_content_cache() {
        let llm = StubLlm::scripted(vec![
            Ok(LlmResponse {
                output_text: "first".into(),
                tokens_in: 1,
                tokens_out: 1,
                cost: 0.0,
            }),
            Ok(LlmResponse {
                output_text: "second".into(),
                tokens_in: 1,
                tokens_out: 1,
                cost: 0.0,
            }),
        ]);
        let fx = fixture(llm, false);
        fx.worker.process(&fx.message).await.expect("first run");

        // Force a re-analysis; the oracle stub would still work, but the
        // cached text makes the download irrelevant.
        let s = &fx.worker.store;
        let forced = s
            .enqueue_analysis_job(fx.transcript_id, true, t0())
            .unwrap()
            .job()
            .unwrap()
            .clone();
        s.publish(
            QueueName::AnalysisRequest,
            &AnalysisRequestMsg {
                job_id: forced.id,
                transcript_id: fx.transcript_id,
                source_url: "https://x.example/a.pdf".into(),
                force: true,
            },
            Duration::zero(),
            t0(),
        )
        .unwrap();
        let message = s
            .claim(QueueName::AnalysisRequest, 1, t0())
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        fx.worker.process(&message).await.expect("forced run");

        // Both analyses retained (the force does not erase history).
        assert_eq!(fx.worker.store.count_analyses_for(fx.transcript_id).unwrap(), 2);
    }
}
