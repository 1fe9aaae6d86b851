//! Vector store REST client (Chroma-compatible).
//!
//! The collection is created with cosine space, so `similarity = 1 - distance`
//! everywhere downstream. Upserts are keyed by `venue:market_id`, which keeps
//! at most one row per market with the newest snapshot winning.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::collectors::{backoff, should_retry};
use crate::config::env_string;

pub const DEFAULT_CHROMA_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
struct CreateCollectionRequest<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Default, Serialize)]
pub struct UpsertRequest {
    pub ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metadatas: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Default, Serialize)]
pub struct QueryRequest {
    pub query_embeddings: Vec<Vec<f32>>,
    pub n_results: usize,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_filter: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub ids: Vec<Vec<String>>,
    #[serde(default)]
    pub documents: Vec<Vec<String>>,
    #[serde(default)]
    pub distances: Vec<Vec<f32>>,
    #[serde(default)]
    pub metadatas: Vec<Vec<serde_json::Value>>,
}

impl QueryResponse {
    /// Distance of the i-th hit of the first query, defaulting to the maximum.
    pub fn distance_at(&self, idx: usize) -> f64 {
        self.distances
            .first()
            .and_then(|row| row.get(idx))
            .map(|d| *d as f64)
            .unwrap_or(1.0)
    }
}

#[derive(Debug, Default, Serialize)]
pub struct GetRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_filter: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GetResponse {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub documents: Vec<String>,
    #[serde(default)]
    pub metadatas: Vec<serde_json::Value>,
}

/// Thin REST client; cheap to clone and safe for concurrent use.
#[derive(Clone)]
pub struct ChromaClient {
    base_url: String,
    http: reqwest::Client,
}

impl ChromaClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build chroma http client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(env_string("CHROMA_URL", DEFAULT_CHROMA_URL))
    }

    /// Fetches the collection, creating it with cosine space if missing.
    pub async fn ensure_collection(&self, name: &str) -> Result<Collection> {
        if let Ok(collection) = self.get_collection(name).await {
            return Ok(collection);
        }
        match self
            .create_collection(name, serde_json::json!({"hnsw:space": "cosine"}))
            .await
        {
            Ok(collection) => Ok(collection),
            // lost a create race; the collection exists now
            Err(_) => self.get_collection(name).await,
        }
    }

    pub async fn create_collection(
        &self,
        name: &str,
        metadata: serde_json::Value,
    ) -> Result<Collection> {
        let req = CreateCollectionRequest {
            name,
            metadata: Some(metadata),
        };
        self.post_json("/api/v1/collections", &req).await
    }

    pub async fn get_collection(&self, name: &str) -> Result<Collection> {
        self.get_json(&format!("/api/v1/collections/{name}")).await
    }

    pub async fn upsert(&self, collection_id: &str, req: &UpsertRequest) -> Result<()> {
        self.post_no_response(&format!("/api/v1/collections/{collection_id}/upsert"), req)
            .await
    }

    pub async fn query(&self, collection_id: &str, req: &QueryRequest) -> Result<QueryResponse> {
        self.post_json(&format!("/api/v1/collections/{collection_id}/query"), req)
            .await
    }

    pub async fn get(&self, collection_id: &str, req: &GetRequest) -> Result<GetResponse> {
        self.post_json(&format!("/api/v1/collections/{collection_id}/get"), req)
            .await
    }

    pub async fn count(&self, collection_id: &str) -> Result<u64> {
        self.get_json(&format!("/api/v1/collections/{collection_id}/count"))
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.send_with_retry(path, None::<&()>).await?;
        resp.json().await.context("decode chroma response")
    }

    async fn post_json<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self.send_with_retry(path, Some(body)).await?;
        resp.json().await.context("decode chroma response")
    }

    async fn post_no_response<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        self.send_with_retry(path, Some(body)).await?;
        Ok(())
    }

    /// Transient faults (connect errors, 429, 5xx) back off and retry; other
    /// statuses fail immediately.
    async fn send_with_retry<B: Serialize>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = match body {
                Some(body) => self.http.post(&url).json(body),
                None => self.http.get(&url),
            };
            match request.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    if !should_retry(attempt, Some(status)) {
                        let text = resp.text().await.unwrap_or_default();
                        bail!("chroma {path}: {status} {}", text.trim());
                    }
                }
                Err(err) => {
                    if !should_retry(attempt, None) {
                        return Err(err).context("chroma request");
                    }
                }
            }
            backoff(attempt).await;
        }
    }
}

/// Builds the metadata filter for opposite-venue retrieval with a freshness
/// cutoff: `{"$and": [{"venue": v}, {"captured_at_unix": {"$gte": cutoff}}]}`.
pub fn venue_freshness_filter(venue: &str, cutoff_unix: Option<i64>) -> serde_json::Value {
    match cutoff_unix {
        Some(cutoff) => serde_json::json!({
            "$and": [
                {"venue": venue},
                {"captured_at_unix": {"$gte": cutoff}},
            ]
        }),
        None => serde_json::json!({"venue": venue}),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_request_wire_shape() {
        let req = QueryRequest {
            query_embeddings: vec![vec![0.1, 0.2]],
            n_results: 3,
            where_filter: Some(venue_freshness_filter("kalshi", Some(1_700_000_000))),
            include: vec!["documents".into(), "metadatas".into(), "distances".into()],
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["n_results"], 3);
        assert!(value.get("where").is_some(), "filter must serialize as `where`");
        assert_eq!(value["where"]["$and"][0]["venue"], "kalshi");
        assert_eq!(value["where"]["$and"][1]["captured_at_unix"]["$gte"], 1_700_000_000);
    }

    #[test]
    fn test_filter_without_cutoff_is_flat() {
        let filter = venue_freshness_filter("polymarket", None);
        assert_eq!(filter, serde_json::json!({"venue": "polymarket"}));
    }

    #[test]
    fn test_distance_at_defaults_to_max() {
        let resp = QueryResponse::default();
        assert_eq!(resp.distance_at(0), 1.0);

        let resp = QueryResponse {
            distances: vec![vec![0.05, 0.2]],
            ..QueryResponse::default()
        };
        assert!((resp.distance_at(0) - 0.05).abs() < 1e-6);
        assert_eq!(resp.distance_at(5), 1.0);
    }
}
