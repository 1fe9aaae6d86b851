//! Redis-backed caches for expensive external calls.
//!
//! Three caches share one connection style: embeddings (JSON float vectors),
//! pair verdicts ("1" SAFE / "0" UNSAFE), and best-opportunity records. All
//! expire on a TTL configured at construction. Absence of a cache is a valid
//! configuration; call sites hold an `Option` and degrade to recompute.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;

fn redis_url(cfg: &CacheConfig) -> String {
    match &cfg.password {
        Some(password) => format!("redis://:{}@{}/{}", password, cfg.addr, cfg.db),
        None => format!("redis://{}/{}", cfg.addr, cfg.db),
    }
}

async fn connect(cfg: &CacheConfig) -> Result<ConnectionManager> {
    let client = redis::Client::open(redis_url(cfg)).context("parse redis url")?;
    ConnectionManager::new(client)
        .await
        .context("connect to redis")
}

/// Embedding vectors keyed by `venue:market_id:text_hash`.
#[derive(Clone)]
pub struct EmbeddingCache {
    conn: ConnectionManager,
    ttl_secs: u64,
    prefix: String,
}

impl EmbeddingCache {
    pub async fn connect(cfg: &CacheConfig) -> Result<Self> {
        Ok(Self {
            conn: connect(cfg).await?,
            ttl_secs: cfg.ttl.as_secs().max(1),
            prefix: "emb".to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<f32>>> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn.get(self.key(key)).await.context("redis get")?;
        match raw {
            Some(bytes) => {
                let vector = serde_json::from_slice(&bytes).context("decode cached embedding")?;
                Ok(Some(vector))
            }
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &[f32]) -> Result<()> {
        let mut conn = self.conn.clone();
        let bytes = serde_json::to_vec(value).context("encode embedding")?;
        conn.set_ex::<_, _, ()>(self.key(key), bytes, self.ttl_secs)
            .await
            .context("redis set")
    }
}

/// Interface the matcher and validation stage need from the verdict store:
/// SAFE/UNSAFE decisions keyed by the order-independent pair key. Stores both
/// outcomes; only LLM errors go uncached. Callers test against an in-memory
/// implementation.
#[async_trait]
pub trait VerdictCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<bool>>;
    async fn set(&self, key: &str, verdict: bool) -> Result<()>;
}

#[derive(Clone)]
pub struct RedisVerdictCache {
    conn: ConnectionManager,
    ttl_secs: u64,
    prefix: String,
}

impl RedisVerdictCache {
    pub async fn connect(cfg: &CacheConfig) -> Result<Self> {
        Ok(Self {
            conn: connect(cfg).await?,
            ttl_secs: cfg.ttl.as_secs().max(1),
            prefix: "pair_verdict".to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl VerdictCache for RedisVerdictCache {
    async fn get(&self, key: &str) -> Result<Option<bool>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.key(key)).await.context("redis get")?;
        Ok(raw.map(|value| value == "1"))
    }

    async fn set(&self, key: &str, verdict: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        let value = if verdict { "1" } else { "0" };
        conn.set_ex::<_, _, ()>(self.key(key), value, self.ttl_secs)
            .await
            .context("redis set")
    }
}

/// Best profitable result for a pair, for suppressing duplicate downstream
/// notifications. Not consulted by the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityRecord {
    pub profit_usd: f64,
    pub direction: String,
    pub quantity: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct OpportunityCache {
    conn: ConnectionManager,
    ttl_secs: u64,
    prefix: String,
}

impl OpportunityCache {
    pub async fn connect(cfg: &CacheConfig) -> Result<Self> {
        Ok(Self {
            conn: connect(cfg).await?,
            ttl_secs: cfg.ttl.as_secs().max(1),
            prefix: "pair_best".to_string(),
        })
    }

    fn key(&self, pair_id: &str) -> String {
        format!("{}:{}", self.prefix, pair_id)
    }

    pub async fn get(&self, pair_id: &str) -> Result<Option<OpportunityRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn.get(self.key(pair_id)).await.context("redis get")?;
        match raw {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes).context("decode opportunity record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub async fn set(&self, pair_id: &str, record: &OpportunityRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let bytes = serde_json::to_vec(record).context("encode opportunity record")?;
        conn.set_ex::<_, _, ()>(self.key(pair_id), bytes, self.ttl_secs)
            .await
            .context("redis set")
    }
}

// =============================================================================
// TESTS
// =============================================================================
