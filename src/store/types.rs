//! Row types and status enums for the relational store.
//!
//! Statuses are stored as TEXT; the enums here are the single source of
//! truth for the legal values. Conversions go through `as_str`/`parse`
//! so a typo'd status string can never reach SQL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fiscal::Quarter;

/// A tracked equity from the ingested universe.
#[derive(Debug, Clone)]
pub struct Equity {
    pub id: i64,
    pub symbol: Option<String>,
    pub alt_code: Option<String>,
    /// Unique external identifier (ISIN or equivalent).
    pub identifier: String,
    pub name: String,
}

impl Equity {
    /// The symbol used against the oracle: primary symbol, falling back to
    /// the alternate exchange code.
    pub fn oracle_symbol(&self) -> Option<&str> {
        self.symbol
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.alt_code.as_deref().filter(|s| !s.is_empty()))
    }
}

/// A research group of equities.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub deep_research_prompt: Option<String>,
    pub stock_summary_prompt: Option<String>,
    pub is_active: bool,
}

/// Observed lifecycle of a transcript slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptStatus {
    None,
    Upcoming,
    Available,
}

impl TranscriptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TranscriptStatus::None => "none",
            TranscriptStatus::Upcoming => "upcoming",
            TranscriptStatus::Available => "available",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(TranscriptStatus::None),
            "upcoming" => Some(TranscriptStatus::Upcoming),
            "available" => Some(TranscriptStatus::Available),
            _ => None,
        }
    }
}

/// Per-transcript analysis progress marker (the at-most-one lock).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisStatus {
    InProgress,
    Done,
    Error,
}

impl AnalysisStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisStatus::InProgress => "in_progress",
            AnalysisStatus::Done => "done",
            AnalysisStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "in_progress" => Some(AnalysisStatus::InProgress),
            "done" => Some(AnalysisStatus::Done),
            "error" => Some(AnalysisStatus::Error),
            _ => None,
        }
    }
}

/// One `(equity, quarter, year)` transcript slot.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub id: i64,
    pub equity_id: i64,
    pub quarter: Quarter,
    pub year: i32,
    pub source_url: Option<String>,
    pub content_path: Option<String>,
    pub status: TranscriptStatus,
    pub event_date: Option<DateTime<Utc>>,
    pub analysis_status: Option<AnalysisStatus>,
    pub analysis_error: Option<String>,
}

/// A polling schedule row.
#[derive(Debug, Clone)]
pub struct FetchScheduleRow {
    pub id: i64,
    pub equity_id: i64,
    pub quarter: Quarter,
    pub year: i32,
    pub priority: i64,
    pub next_check_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_available_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub locked_until: Option<DateTime<Utc>>,
}

/// Durable analysis job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    InProgress,
    Done,
    Error,
    Dead,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(JobStatus::Pending),
            "in_progress" => Some(JobStatus::InProgress),
            "done" => Some(JobStatus::Done),
            "error" => Some(JobStatus::Error),
            "dead" => Some(JobStatus::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Dead)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisJob {
    pub id: i64,
    pub transcript_id: i64,
    pub status: JobStatus,
    pub attempts: i64,
    pub idempotency_key: String,
    pub force: bool,
    pub last_error: Option<String>,
    pub retry_next_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
}

/// A completed language-model analysis of one transcript.
#[derive(Debug, Clone)]
pub struct TranscriptAnalysis {
    pub id: i64,
    pub transcript_id: i64,
    pub prompt_snapshot: String,
    pub output_text: String,
    pub model_provider: String,
    pub model_id: String,
    pub model_revision: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

/// Email outbox row state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Dead => "dead",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(OutboxStatus::Pending),
            "sent" => Some(OutboxStatus::Sent),
            "failed" => Some(OutboxStatus::Failed),
            "dead" => Some(OutboxStatus::Dead),
            _ => None,
        }
    }
}

/// One email to one recipient, referencing either an analysis or a group
/// research run.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub analysis_id: Option<i64>,
    pub research_run_id: Option<i64>,
    pub recipient: String,
    pub status: OutboxStatus,
    pub attempts: i64,
    pub scheduled_at: DateTime<Utc>,
    pub retry_next_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Group research run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    InProgress,
    Done,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Done => "done",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(RunStatus::Pending),
            "in_progress" => Some(RunStatus::InProgress),
            "done" => Some(RunStatus::Done),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }
}

/// One per-group research article for a `(quarter, year)`.
#[derive(Debug, Clone)]
pub struct GroupResearchRun {
    pub id: i64,
    pub group_id: i64,
    pub quarter: Quarter,
    pub year: i32,
    pub status: RunStatus,
    pub prompt_snapshot: Option<String>,
    pub output_text: Option<String>,
    pub model_provider: Option<String>,
    pub model_id: Option<String>,
    pub model_revision: Option<String>,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for s in ["none", "upcoming", "available"] {
            assert_eq!(TranscriptStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["pending", "in_progress", "done", "error", "dead"] {
            assert_eq!(JobStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["pending", "sent", "failed", "dead"] {
            assert_eq!(OutboxStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["pending", "in_progress", "done", "error"] {
            assert_eq!(RunStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(TranscriptStatus::parse("bogus").is_none());
    }

    #[test]
    fn test_oracle_symbol_falls_back_to_alt_code() {
        let mut equity = Equity {
            id: 1,
            symbol: None,
            alt_code: Some("500325".into()),
            identifier: "INE002A01018".into(),
            name: "Reliant Industries".into(),
        };
        assert_eq!(equity.oracle_symbol(), Some("500325"));

        equity.symbol = Some("RELIANT".into());
        assert_eq!(equity.oracle_symbol(), Some("RELIANT"));

        equity.symbol = Some(String::new());
        assert_eq!(equity.oracle_symbol(), Some("500325"));
    }

    #[test]
    fn test_job_terminal_states() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Dead.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }
}
