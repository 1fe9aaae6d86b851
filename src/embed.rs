//! Embedding provider client (OpenAI-compatible REST).

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::{env_opt_string, env_string};

const DEFAULT_BASE_URL: &str = "https://api.tokenfactory.nebius.com/v1";
const DEFAULT_MODEL: &str = "Qwen/Qwen3-Embedding-8B";

/// Controls how the embedding client is constructed.
#[derive(Debug, Clone)]
pub struct EmbedConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl EmbedConfig {
    /// Reads the config from the environment. A missing `EMBED_API_KEY` is a
    /// fatal configuration fault.
    pub fn from_env() -> Result<Self> {
        let api_key =
            env_opt_string("EMBED_API_KEY").ok_or_else(|| anyhow!("EMBED_API_KEY not set"))?;
        Ok(Self {
            api_key,
            base_url: env_string("EMBED_BASE_URL", DEFAULT_BASE_URL),
            model: env_string("EMBED_MODEL", DEFAULT_MODEL),
        })
    }
}

/// Calls the `/embeddings` endpoint of an OpenAI-compatible provider.
#[derive(Clone)]
pub struct EmbedClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl EmbedClient {
    pub fn new(cfg: EmbedConfig) -> Result<Self> {
        if cfg.api_key.trim().is_empty() {
            bail!("embed: API key is required");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("build embed http client")?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key,
            model: cfg.model,
        })
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let req = EmbeddingRequest {
            model: &self.model,
            input: [text],
        };
        let resp = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("embedding request")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(800).collect();
            bail!("embedding API {status}: {snippet}");
        }

        let parsed: EmbeddingResponse = resp.json().await.context("decode embedding response")?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow!("embedding response empty"))
    }
}
