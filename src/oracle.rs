//! The transcript oracle: the external discovery API.
//!
//! For a given `(equity, quarter, year)` the oracle answers one of
//! available (with a source URL), upcoming (with an event date), or none.
//! HTTP failures are classified once, here, into the shared
//! transient/permanent taxonomy; 429 is its own variant because the
//! fetcher reacts to it by shrinking the rate bucket.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::fiscal::{quarter_covered_by_event, QuarterYear};
use crate::retry::ErrorClass;
use crate::store::types::Equity;

/// Deadline for a single oracle call.
pub const ORACLE_TIMEOUT_SECS: u64 = 15;

/// Browsery user agent: some transcript CDNs reject default client UAs.
const DOWNLOAD_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/119.0.0.0 Safari/537.36";

/// What the oracle said about a transcript slot.
#[derive(Debug, Clone, PartialEq)]
pub enum OracleStatus {
    Available {
        source_url: String,
        event_date: Option<DateTime<Utc>>,
    },
    Upcoming {
        event_date: DateTime<Utc>,
    },
    None,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Oracle rate limited (429)")]
    RateLimited,

    #[error("Transient oracle error: {0}")]
    Transient(String),

    #[error("Permanent oracle error: {0}")]
    Permanent(String),
}

impl OracleError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OracleError::RateLimited | OracleError::Transient(_) => ErrorClass::Transient,
            OracleError::Permanent(_) => ErrorClass::Permanent,
        }
    }
}

/// The external transcript-discovery API.
#[async_trait]
pub trait TranscriptOracle: Send + Sync {
    /// Ask about one transcript slot.
    async fn check(&self, equity: &Equity, slot: QuarterYear) -> Result<OracleStatus, OracleError>;

    /// Fetch the raw transcript document behind a source URL.
    async fn download(&self, source_url: &str) -> Result<Vec<u8>, OracleError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    data: Vec<ListItem>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    concall_event_time: Option<String>,
    #[serde(default)]
    event_time: Option<String>,
    #[serde(default)]
    event_date: Option<String>,
}

impl ListItem {
    fn event_time(&self) -> Option<DateTime<Utc>> {
        let raw = self
            .concall_event_time
            .as_deref()
            .or(self.event_time.as_deref())
            .or(self.event_date.as_deref())?;
        parse_event_time(raw)
    }
}

/// Provider event times arrive as RFC 3339 (sometimes `Z`-suffixed) or
/// bare `YYYY-MM-DD [HH:MM:SS]`.
fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw.replace('Z', "+00:00")) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
        if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, format) {
            return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
        }
    }
    None
}

/// Percent-encode unsafe characters (notably spaces) that providers leave
/// in transcript URLs.
pub fn sanitize_url(url: &str) -> String {
    url.trim().replace(' ', "%20")
}

pub struct HttpOracle {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpOracle {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(ORACLE_TIMEOUT_SECS))
            .user_agent(DOWNLOAD_USER_AGENT)
            .build()
            .map_err(|e| OracleError::Permanent(format!("HTTP client build failed: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn list(&self, identifier: &str, upcoming: bool) -> Result<ListResponse, OracleError> {
        let url = format!("{}/concalls/list", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[
                ("page", "1"),
                ("isin", identifier),
                ("upcoming", if upcoming { "true" } else { "false" }),
                ("page_size", if upcoming { "20" } else { "5" }),
            ])
            .send()
            .await
            .map_err(classify_request_error)?;

        let response = classify_status(response)?;
        response
            .json::<ListResponse>()
            .await
            .map_err(|e| OracleError::Permanent(format!("Malformed oracle response: {}", e)))
    }
}

fn classify_request_error(e: reqwest::Error) -> OracleError {
    // Connect failures, timeouts, and body truncation are all retryable.
    OracleError::Transient(e.to_string())
}

fn classify_status(response: reqwest::Response) -> Result<reqwest::Response, OracleError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.as_u16() == 429 {
        return Err(OracleError::RateLimited);
    }
    if status.is_server_error() {
        return Err(OracleError::Transient(format!("oracle returned {}", status)));
    }
    Err(OracleError::Permanent(format!("oracle returned {}", status)))
}

#[async_trait]
impl TranscriptOracle for HttpOracle {
    async fn check(&self, equity: &Equity, slot: QuarterYear) -> Result<OracleStatus, OracleError> {
        // Released transcripts first.
        let released = self.list(&equity.identifier, false).await?;
        for item in &released.data {
            let Some(url) = item.transcript.as_deref().filter(|u| !u.is_empty()) else {
                continue;
            };
            let Some(event_time) = item.event_time() else {
                continue;
            };
            if quarter_covered_by_event(event_time) == slot {
                return Ok(OracleStatus::Available {
                    source_url: sanitize_url(url),
                    event_date: Some(event_time),
                });
            }
        }

        // Then scheduled calls.
        let upcoming = self.list(&equity.identifier, true).await?;
        for item in &upcoming.data {
            if let Some(status) = item.status.as_deref() {
                if !status.trim().is_empty() && !status.trim().eq_ignore_ascii_case("upcoming") {
                    continue;
                }
            }
            let Some(event_time) = item.event_time() else {
                continue;
            };
            if quarter_covered_by_event(event_time) == slot {
                return Ok(OracleStatus::Upcoming {
                    event_date: event_time,
                });
            }
        }

        Ok(OracleStatus::None)
    }

    async fn download(&self, source_url: &str) -> Result<Vec<u8>, OracleError> {
        let safe_url = sanitize_url(source_url);
        let mut response = self
            .client
            .get(&safe_url)
            .header("Accept", "application/pdf,application/octet-stream;q=0.9,*/*;q=0.8")
            .send()
            .await
            .map_err(classify_request_error)?;

        // Some CDNs want a referrer; retry once before classifying 403.
        if response.status().as_u16() == 403 {
            let referer = safe_url.rsplit_once('/').map(|(base, _)| base).unwrap_or("");
            response = self
                .client
                .get(&safe_url)
                .header("Accept", "application/pdf,application/octet-stream;q=0.9,*/*;q=0.8")
                .header("Referer", referer)
                .send()
                .await
                .map_err(classify_request_error)?;
        }

        let response = classify_status(response)?;
        let bytes = response
            .bytes()
            .await
            .map_err(classify_request_error)?;
        Ok(bytes.to_vec())
    }
}
