//! OpenAI Chat Completions client.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{
    classify_provider_status, usage_cost, GenerateOptions, LlmClient, LlmError, LlmResponse,
    ModelRef, LLM_TIMEOUT_SECS,
};
use crate::config::LlmConfig;

const API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: ChatUsage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    model: ModelRef,
    cost_per_1m_input: f64,
    cost_per_1m_output: f64,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(LLM_TIMEOUT_SECS))
            .build()
            .map_err(|e| LlmError::Permanent(format!("HTTP client build failed: {}", e)))?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: ModelRef {
                provider: "openai".into(),
                model_id: config.model_id.clone(),
                revision: config.revision.clone(),
            },
            cost_per_1m_input: config.cost_per_1m_input,
            cost_per_1m_output: config.cost_per_1m_output,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(
        &self,
        system_prompt: &str,
        input_text: &str,
        options: &GenerateOptions,
    ) -> Result<LlmResponse, LlmError> {
        let body = json!({
            "model": self.model.model_id,
            "max_completion_tokens": options.max_output_tokens,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": input_text },
            ],
        });

        let response = self
            .client
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_provider_status(status, &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Permanent(format!("Malformed provider response: {}", e)))?;

        let output_text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        if output_text.is_empty() {
            return Err(LlmError::Permanent("Provider returned no text content".into()));
        }

        Ok(LlmResponse {
            output_text,
            tokens_in: parsed.usage.prompt_tokens,
            tokens_out: parsed.usage.completion_tokens,
            cost: usage_cost(
                parsed.usage.prompt_tokens,
                parsed.usage.completion_tokens,
                self.cost_per_1m_input,
                self.cost_per_1m_output,
            ),
        })
    }

    fn model_ref(&self) -> &ModelRef {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let raw = r#"{
            "choices": [
                { "message": { "role": "assistant", "content": "Guidance raised." } }
            ],
            "usage": { "prompt_tokens": 900, "completion_tokens": 120 }
        }"#;
        let parsed: ChatResponse = serde_json::from_str(raw).expect("parse");
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("Guidance raised.")
        );
        assert_eq!(parsed.usage.completion_tokens, 120);
    }
}
