//! Language-model providers: text in, text out, usage counters back.
//!
//! The provider set is closed — `anthropic` and `openai` — dispatched
//! from config. Every response carries token counts and a cost computed
//! from the configured per-1M rates, so accounting never depends on a
//! provider's own price sheet being current.

mod anthropic;
mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

use crate::config::LlmConfig;
use crate::retry::ErrorClass;

/// Deadline for a single generation call.
pub const LLM_TIMEOUT_SECS: u64 = 120;

/// Stable identifier of the model that produced an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: String,
    pub model_id: String,
    pub revision: Option<String>,
}

/// Per-call generation options.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_output_tokens: u32,
    pub thinking_enabled: bool,
    pub thinking_budget: u32,
}

/// A completed generation with usage counters.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub output_text: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost: f64,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Provider rate limited (429)")]
    RateLimited,

    #[error("Transient provider error: {0}")]
    Transient(String),

    #[error("Permanent provider error: {0}")]
    Permanent(String),
}

impl LlmError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LlmError::RateLimited | LlmError::Transient(_) => ErrorClass::Transient,
            LlmError::Permanent(_) => ErrorClass::Permanent,
        }
    }
}

/// A text-generation provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        input_text: &str,
        options: &GenerateOptions,
    ) -> Result<LlmResponse, LlmError>;

    fn model_ref(&self) -> &ModelRef;
}

/// USD cost of a call given per-1M-token rates.
pub(crate) fn usage_cost(tokens_in: i64, tokens_out: i64, per_1m_in: f64, per_1m_out: f64) -> f64 {
    (tokens_in as f64 / 1_000_000.0) * per_1m_in + (tokens_out as f64 / 1_000_000.0) * per_1m_out
}

pub(crate) fn classify_provider_status(status: reqwest::StatusCode, body: &str) -> LlmError {
    if status.as_u16() == 429 {
        return LlmError::RateLimited;
    }
    if status.is_server_error() {
        return LlmError::Transient(format!("provider returned {}: {}", status, truncate(body)));
    }
    LlmError::Permanent(format!("provider returned {}: {}", status, truncate(body)))
}

fn truncate(body: &str) -> String {
    body.chars().take(300).collect()
}

/// Build the configured provider. The dispatch table is the closed set of
/// providers this build knows about.
pub fn client_from_config(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicClient::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiClient::new(config)?)),
        other => Err(LlmError::Permanent(format!(
            "unknown provider '{}'",
            other
        ))),
    }
}
