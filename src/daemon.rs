//! Process assembly: open stores, build the external clients, spawn the
//! worker set, and run until shutdown.
//!
//! Each worker gets its own store connection; coordination is entirely
//! through the database and queue tables, so workers could be moved to a
//! sidecar process without any API change.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::analysis_worker::AnalysisWorker;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::content_store::{ContentStore, ContentStoreError};
use crate::email_worker::EmailWorker;
use crate::fetcher::Fetcher;
use crate::group_research::GroupResearchCoordinator;
use crate::llm::{client_from_config, GenerateOptions, LlmError};
use crate::mailer::{MailError, SmtpMailer};
use crate::oracle::{HttpOracle, OracleError};
use crate::rate_limit::AdaptiveLimiter;
use crate::recovery::run_startup_recovery;
use crate::scheduler::{Scheduler, SchedulerState};
use crate::store::{Store, StoreError};

/// Shutdown grace period for in-flight work.
const SHUTDOWN_GRACE_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Content store error: {0}")]
    Content(#[from] ContentStoreError),

    #[error("Oracle setup failed: {0}")]
    Oracle(#[from] OracleError),

    #[error("LLM setup failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Mailer setup failed: {0}")]
    Mail(#[from] MailError),
}

impl DaemonError {
    /// True when the failure is the store migration step (exit code 2).
    pub fn is_migration_failure(&self) -> bool {
        matches!(self, DaemonError::Store(StoreError::Migration(_)))
    }
}

pub struct Daemon {
    config: Config,
    db_path: std::path::PathBuf,
    content_dir: std::path::PathBuf,
    pub scheduler_state: Arc<SchedulerState>,
}

impl Daemon {
    pub fn new(config: Config, config_path: &Path) -> Self {
        let db_path = config.database_path(config_path);
        let content_dir = config.content_dir(config_path);
        Self {
            config,
            db_path,
            content_dir,
            scheduler_state: SchedulerState::new(),
        }
    }

    fn open_store(&self) -> Result<Store, StoreError> {
        Store::open(&self.db_path)
    }

    /// Run migrations and startup recovery. Called once before spawning.
    pub fn prepare(&self) -> Result<(), DaemonError> {
        let store = self.open_store()?;
        let clock = SystemClock;
        run_startup_recovery(&store, clock.now())?;
        Ok(())
    }

    /// Spawn the worker set and run until `ctrl-c` (or the returned
    /// sender is fired). Blocks until shutdown completes.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let oracle: Arc<dyn crate::oracle::TranscriptOracle> = Arc::new(HttpOracle::new(
            &self.config.oracle.base_url,
            &self.config.oracle.api_key,
        )?);
        let limiter = Arc::new(AdaptiveLimiter::new(self.config.oracle.max_qps));
        let llm = client_from_config(&self.config.llm)?;
        let content = ContentStore::open(&self.content_dir)?;
        let options = GenerateOptions {
            max_output_tokens: self.config.llm.max_output_tokens,
            thinking_enabled: self.config.llm.thinking_enabled,
            thinking_budget: self.config.llm.thinking_budget,
        };

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        // One scheduler task.
        let scheduler = Scheduler::new(
            self.open_store()?,
            clock.clone(),
            self.scheduler_state.clone(),
            shutdown_rx.clone(),
        );
        handles.push(tokio::spawn(scheduler.run()));

        // Fetcher pool.
        for id in 0..self.config.workers.fetchers {
            let fetcher = Fetcher::new(
                id,
                self.open_store()?,
                oracle.clone(),
                limiter.clone(),
                clock.clone(),
                shutdown_rx.clone(),
            );
            handles.push(tokio::spawn(fetcher.run()));
        }

        // Analysis pool.
        for id in 0..self.config.workers.analysts {
            let worker = AnalysisWorker::new(
                id,
                self.open_store()?,
                oracle.clone(),
                llm.clone(),
                content.clone(),
                self.config.default_analysis_prompt.clone(),
                options.clone(),
                clock.clone(),
                shutdown_rx.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
        }

        // Email pool — only with SMTP configured; outbox rows queue up
        // harmlessly otherwise.
        match &self.config.smtp {
            Some(smtp) => {
                let mailer: Arc<dyn crate::mailer::Mailer> = Arc::new(SmtpMailer::new(smtp)?);
                for id in 0..self.config.workers.emailers {
                    let worker = EmailWorker::new(
                        id,
                        self.open_store()?,
                        mailer.clone(),
                        clock.clone(),
                        shutdown_rx.clone(),
                    );
                    handles.push(tokio::spawn(worker.run()));
                }
            }
            None => {
                log::warn!("No SMTP configuration: email outbox will accumulate unsent rows");
            }
        }

        // One coordinator task.
        let coordinator = GroupResearchCoordinator::new(
            self.open_store()?,
            oracle.clone(),
            llm.clone(),
            content.clone(),
            options.clone(),
            clock.clone(),
            shutdown_rx.clone(),
        );
        handles.push(tokio::spawn(coordinator.run()));

        log::info!(
            "Daemon: running with {} fetchers, {} analysts, {} emailers",
            self.config.workers.fetchers,
            self.config.workers.analysts,
            self.config.workers.emailers
        );

        // Wait for the shutdown signal.
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("Daemon: shutdown signal received"),
            Err(e) => log::warn!("Daemon: signal listener failed ({}), shutting down", e),
        }

        // Stop claiming new work; give in-flight work the grace period.
        // Unfinished leases simply expire for the next process to resume.
        let _ = shutdown_tx.send(true);
        let grace = std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS);
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            log::warn!(
                "Daemon: workers still busy after {}s grace, abandoning leases",
                SHUTDOWN_GRACE_SECS
            );
        }

        log::info!("Daemon: stopped");
        Ok(())
    }
}
