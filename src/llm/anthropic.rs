//! Anthropic Messages API client.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{
    classify_provider_status, usage_cost, GenerateOptions, LlmClient, LlmError, LlmResponse,
    ModelRef, LLM_TIMEOUT_SECS,
};
use crate::config::LlmConfig;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    model: ModelRef,
    cost_per_1m_input: f64,
    cost_per_1m_output: f64,
}

impl AnthropicClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(LLM_TIMEOUT_SECS))
            .build()
            .map_err(|e| LlmError::Permanent(format!("HTTP client build failed: {}", e)))?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: ModelRef {
                provider: "anthropic".into(),
                model_id: config.model_id.clone(),
                revision: config.revision.clone(),
            },
            cost_per_1m_input: config.cost_per_1m_input,
            cost_per_1m_output: config.cost_per_1m_output,
        })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn generate(
        &self,
        system_prompt: &str,
        input_text: &str,
        options: &GenerateOptions,
    ) -> Result<LlmResponse, LlmError> {
        let mut body = json!({
            "model": self.model.model_id,
            "max_tokens": options.max_output_tokens,
            "system": system_prompt,
            "messages": [{ "role": "user", "content": input_text }],
        });
        if options.thinking_enabled && options.thinking_budget > 0 {
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": options.thinking_budget,
            });
        }

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_provider_status(status, &body));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Permanent(format!("Malformed provider response: {}", e)))?;

        // Thinking blocks precede the text block; take the text parts only.
        let output_text: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        if output_text.is_empty() {
            return Err(LlmError::Permanent("Provider returned no text content".into()));
        }

        Ok(LlmResponse {
            output_text,
            tokens_in: parsed.usage.input_tokens,
            tokens_out: parsed.usage.output_tokens,
            cost: usage_cost(
                parsed.usage.input_tokens,
                parsed.usage.output_tokens,
                self.cost_per_1m_input,
                self.cost_per_1m_output,
            ),
        })
    }

    fn model_ref(&self) -> &ModelRef {
        &self.model
    }
}
