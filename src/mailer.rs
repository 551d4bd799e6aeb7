//! SMTP transport and email rendering.
//!
//! Analysis reports and group articles are rendered from embedded HTML
//! templates with `{{PLACEHOLDER}}` substitution. Model output is
//! Markdown; tables survive the trip because rows get normalised before
//! conversion (providers love to indent them, which breaks parsers).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use pulldown_cmark::{html, Options, Parser};
use thiserror::Error;

use crate::config::SmtpConfig;
use crate::retry::ErrorClass;

/// Deadline for one SMTP conversation.
pub const SMTP_TIMEOUT_SECS: u64 = 30;

const ANALYSIS_TEMPLATE: &str = include_str!("templates/analysis_report.html");
const GROUP_TEMPLATE: &str = include_str!("templates/group_article.html");

#[derive(Debug, Error)]
pub enum MailError {
    #[error("Transient mail error: {0}")]
    Transient(String),

    #[error("Permanent mail error: {0}")]
    Permanent(String),
}

impl MailError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MailError::Transient(_) => ErrorClass::Transient,
            MailError::Permanent(_) => ErrorClass::Permanent,
        }
    }
}

/// A rendered email ready for transport.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body_html: String,
}

/// The SMTP boundary, mockable in tests.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError>;
}

// ---------------------------------------------------------------------------
// SMTP implementation
// ---------------------------------------------------------------------------

pub struct SmtpMailer {
    transport: SmtpTransport,
    from_address: String,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let transport = SmtpTransport::starttls_relay(&config.host)
            .map_err(|e| MailError::Permanent(format!("SMTP relay setup failed: {}", e)))?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .timeout(Some(std::time::Duration::from_secs(SMTP_TIMEOUT_SECS)))
            .build();
        Ok(Self {
            transport,
            from_address: config.from_address.clone(),
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        let email = Message::builder()
            .from(
                self.from_address
                    .parse()
                    .map_err(|e| MailError::Permanent(format!("bad from address: {}", e)))?,
            )
            .to(message
                .to
                .parse()
                .map_err(|e| MailError::Permanent(format!("bad recipient address: {}", e)))?)
            .subject(&message.subject)
            .header(ContentType::TEXT_HTML)
            .body(message.body_html.clone())
            .map_err(|e| MailError::Permanent(format!("message build failed: {}", e)))?;

        let transport = self.transport.clone();
        let outcome = tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| MailError::Transient(format!("send task failed: {}", e)))?;

        match outcome {
            Ok(_) => Ok(()),
            // SMTP 5xx is final; 4xx and connection trouble are retryable.
            Err(e) if e.is_permanent() => Err(MailError::Permanent(e.to_string())),
            Err(e) => Err(MailError::Transient(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Straighten common model Markdown quirks so tables convert: strip
/// leading whitespace on pipe-table rows and surround table blocks with
/// blank lines.
fn normalize_markdown(text: &str) -> String {
    let mut cleaned: Vec<String> = Vec::new();
    let mut in_table = false;
    for line in text.lines() {
        let stripped = line.trim_start();
        let is_table_row = stripped.starts_with('|') && stripped.matches('|').count() >= 2;

        if is_table_row && !in_table {
            if cleaned.last().map(|l| !l.trim().is_empty()).unwrap_or(false) {
                cleaned.push(String::new());
            }
            in_table = true;
        } else if !is_table_row && in_table {
            if cleaned.last().map(|l| !l.trim().is_empty()).unwrap_or(false) {
                cleaned.push(String::new());
            }
            in_table = false;
        }

        cleaned.push(if is_table_row {
            stripped.to_string()
        } else {
            line.to_string()
        });
    }
    cleaned.join("\n")
}

/// Model output (Markdown) to email-safe HTML.
pub fn markdown_to_html(markdown: &str) -> String {
    let normalized = normalize_markdown(markdown);
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let parser = Parser::new_ext(&normalized, options);
    let mut out = String::with_capacity(normalized.len() * 2);
    html::push_html(&mut out, parser);
    out
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{}}}}}", key), value);
    }
    out
}

/// Inputs for the per-equity analysis report email.
pub struct AnalysisEmail<'a> {
    pub recipient: &'a str,
    pub equity_symbol: &'a str,
    pub equity_name: &'a str,
    pub quarter: &'a str,
    pub year: i32,
    pub output_markdown: &'a str,
    pub model_name: &'a str,
    pub transcript_url: &'a str,
    pub generated_at: DateTime<Utc>,
}

pub fn render_analysis_email(input: &AnalysisEmail<'_>) -> EmailMessage {
    let body_html = fill(
        ANALYSIS_TEMPLATE,
        &[
            ("EQUITY_SYMBOL", &escape_html(input.equity_symbol)),
            ("EQUITY_NAME", &escape_html(input.equity_name)),
            ("QUARTER", &escape_html(input.quarter)),
            ("YEAR", &input.year.to_string()),
            ("ANALYSIS_CONTENT", &markdown_to_html(input.output_markdown)),
            ("MODEL_NAME", &escape_html(input.model_name)),
            ("TRANSCRIPT_URL", &escape_html(input.transcript_url)),
            (
                "GENERATED_DATE",
                &input.generated_at.format("%B %d, %Y %H:%M UTC").to_string(),
            ),
        ],
    );
    EmailMessage {
        to: input.recipient.to_string(),
        subject: format!(
            "Analysis Report: {} - {} FY{}",
            input.equity_symbol, input.quarter, input.year
        ),
        body_html,
    }
}

/// Inputs for the group research article email.
pub struct GroupArticleEmail<'a> {
    pub recipient: &'a str,
    pub group_name: &'a str,
    pub quarter: &'a str,
    pub year: i32,
    pub equity_list: &'a str,
    pub output_markdown: &'a str,
    pub model_name: &'a str,
    pub generated_at: DateTime<Utc>,
}

pub fn render_group_article_email(input: &GroupArticleEmail<'_>) -> EmailMessage {
    let body_html = fill(
        GROUP_TEMPLATE,
        &[
            ("GROUP_NAME", &escape_html(input.group_name)),
            ("QUARTER", &escape_html(input.quarter)),
            ("YEAR", &input.year.to_string()),
            ("EQUITY_LIST", &escape_html(input.equity_list)),
            ("CONTENT", &markdown_to_html(input.output_markdown)),
            ("MODEL_NAME", &escape_html(input.model_name)),
            (
                "GENERATED_DATE",
                &input.generated_at.format("%B %d, %Y %H:%M UTC").to_string(),
            ),
        ],
    );
    EmailMessage {
        to: input.recipient.to_string(),
        subject: format!(
            "Group Research: {} - {} FY{}",
            input.group_name, input.quarter, input.year
        ),
        body_html,
    }
}
