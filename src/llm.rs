//! Chat-completion client for the validator (OpenAI-compatible REST).

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::{env_f64, env_opt_string, env_string, env_u64};

const DEFAULT_BASE_URL: &str = "https://api.tokenfactory.nebius.com/v1";
const DEFAULT_MODEL: &str = "openai/gpt-oss-120b";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl LlmConfig {
    /// Reads the config from the environment. A missing `LLM_API_KEY` is a
    /// fatal configuration fault.
    pub fn from_env() -> Result<Self> {
        let api_key = env_opt_string("LLM_API_KEY").ok_or_else(|| anyhow!("LLM_API_KEY not set"))?;
        Ok(Self {
            api_key,
            base_url: env_string("LLM_BASE_URL", DEFAULT_BASE_URL),
            model: env_string("LLM_MODEL", DEFAULT_MODEL),
            temperature: env_f64("LLM_TEMPERATURE", 0.0).max(0.0),
            max_tokens: env_u64("LLM_MAX_TOKENS", 800) as u32,
            timeout: Duration::from_secs(env_u64("LLM_TIMEOUT_SECONDS", 45)),
        })
    }
}

/// Single-shot prompt client; cheap to clone and safe for concurrent use.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    timeout: Duration,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Deserialize)]
struct ChatMessageOut {
    #[serde(default)]
    content: String,
}

impl LlmClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        if cfg.api_key.trim().is_empty() {
            bail!("llm: API key is required");
        }
        let http = reqwest::Client::builder()
            .build()
            .context("build llm http client")?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key,
            model: cfg.model,
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            timeout: cfg.timeout,
        })
    }

    /// Sends a system+user prompt pair and returns the trimmed response text.
    pub async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        if system_prompt.is_empty() || user_prompt.is_empty() {
            bail!("llm: prompts must be provided");
        }

        let req = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.timeout)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("llm request")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(800).collect();
            bail!("llm API {status}: {snippet}");
        }

        let parsed: ChatCompletionResponse = resp.json().await.context("decode llm response")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .map(|message| message.content)
            .ok_or_else(|| anyhow!("llm: empty response"))?;
        Ok(content.trim().to_string())
    }
}
