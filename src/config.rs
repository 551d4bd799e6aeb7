//! Daemon configuration loaded from `~/.callwatch/config.json`.
//!
//! The config file carries everything the pipeline needs to talk to the
//! outside world: the transcript provider, the language-model provider,
//! SMTP credentials, and worker sizing. Database and content-store paths
//! default to the same directory as the config file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable that overrides the default config path.
pub const CONFIG_ENV: &str = "CALLWATCH_CONFIG";

/// Errors raised while locating, reading, or validating the config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Transcript provider (oracle) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleConfig {
    pub base_url: String,
    pub api_key: String,
    /// Process-wide request budget against the provider, in queries/second.
    #[serde(default = "default_oracle_qps")]
    pub max_qps: u32,
}

fn default_oracle_qps() -> u32 {
    2
}

/// Language-model provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    /// One of `anthropic` or `openai`.
    pub provider: String,
    pub api_key: String,
    pub model_id: String,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default)]
    pub thinking_enabled: bool,
    #[serde(default)]
    pub thinking_budget: u32,
    /// USD per 1M input tokens, used for cost accounting.
    #[serde(default)]
    pub cost_per_1m_input: f64,
    /// USD per 1M output tokens.
    #[serde(default)]
    pub cost_per_1m_output: f64,
}

fn default_max_output_tokens() -> u32 {
    12_000
}

/// SMTP transport settings for the email outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
}

fn default_smtp_port() -> u16 {
    587
}

/// Worker pool sizing. Defaults match the single-machine deployment the
/// pipeline is built for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    pub fetchers: usize,
    pub analysts: usize,
    pub emailers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fetchers: 4,
            analysts: 2,
            emailers: 2,
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub oracle: OracleConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Fallback system prompt when an equity has no group-level override.
    #[serde(default = "default_prompt")]
    pub default_analysis_prompt: String,
    /// Database file path. Defaults to `<config dir>/callwatch.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Extracted-transcript cache directory. Defaults to `<config dir>/content`.
    #[serde(default)]
    pub content_dir: Option<PathBuf>,
}

fn default_prompt() -> String {
    "You are an equity research analyst. Summarise this earnings-call \
     transcript: management commentary, guidance, risks, and notable \
     analyst questions. Be specific about numbers."
        .to_string()
}

impl Config {
    /// Resolve the config file path: `$CALLWATCH_CONFIG` or
    /// `~/.callwatch/config.json`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
        Ok(home.join(".callwatch").join("config.json"))
    }

    /// Load and validate the config from an explicit path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.oracle.base_url.is_empty() {
            return Err(ConfigError::Invalid("oracle.baseUrl is empty".into()));
        }
        if self.oracle.max_qps == 0 {
            return Err(ConfigError::Invalid("oracle.maxQps must be >= 1".into()));
        }
        match self.llm.provider.as_str() {
            "anthropic" | "openai" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "llm.provider must be 'anthropic' or 'openai', got '{}'",
                    other
                )))
            }
        }
        if self.workers.fetchers == 0 || self.workers.analysts == 0 || self.workers.emailers == 0 {
            return Err(ConfigError::Invalid(
                "worker counts must all be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Database path, defaulting next to the config file.
    pub fn database_path(&self, config_path: &Path) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            config_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("callwatch.db")
        })
    }

    /// Content-store directory, defaulting next to the config file.
    pub fn content_dir(&self, config_path: &Path) -> PathBuf {
        self.content_dir.clone().unwrap_or_else(|| {
            config_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("content")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "oracle": {
                "baseUrl": "https://transcripts.example.com/api/v1",
                "apiKey": "key-123"
            },
            "llm": {
                "provider": "anthropic",
                "apiKey": "sk-test",
                "modelId": "claude-sonnet-4-5"
            }
        })
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: Config = serde_json::from_value(sample_json()).expect("parse");
        config.validate().expect("valid");

        assert_eq!(config.oracle.max_qps, 2);
        assert_eq!(config.workers.fetchers, 4);
        assert_eq!(config.workers.analysts, 2);
        assert_eq!(config.workers.emailers, 2);
        assert_eq!(config.llm.max_output_tokens, 12_000);
        assert!(config.smtp.is_none());
        assert!(!config.default_analysis_prompt.is_empty());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut json = sample_json();
        json["llm"]["provider"] = "mystery".into();
        let config: Config = serde_json::from_value(json).expect("parse");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn test_zero_worker_count_rejected() {
        let mut json = sample_json();
        json["workers"] = serde_json::json!({ "fetchers": 0 });
        let config: Config = serde_json::from_value(json).expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths_default_next_to_config_file() {
        let config: Config = serde_json::from_value(sample_json()).expect("parse");
        let config_path = PathBuf::from("/data/callwatch/config.json");
        assert_eq!(
            config.database_path(&config_path),
            PathBuf::from("/data/callwatch/callwatch.db")
        );
        assert_eq!(
            config.content_dir(&config_path),
            PathBuf::from("/data/callwatch/content")
        );
    }
}
