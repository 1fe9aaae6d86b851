//! Snapshot indexing: embed each snapshot and upsert it into the vector store.
//!
//! The embedding text is a compact digest of the snapshot: title, question,
//! settle date, and sentence-trimmed description/subtitle. The embedding cache
//! is consulted by content hash; the vector upsert is keyed `venue:market_id`
//! so the newest snapshot always wins.

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::cache::EmbeddingCache;
use crate::chroma::{ChromaClient, UpsertRequest};
use crate::embed::EmbedClient;
use crate::hash::{embedding_cache_key, hash_strings};
use crate::types::MarketSnapshot;

const MAX_SENTENCES: usize = 7;

/// One indexing worker's processing pipeline for a single snapshot.
pub struct Processor {
    embed: EmbedClient,
    chroma: ChromaClient,
    collection_id: String,
    cache: Option<EmbeddingCache>,
    log_cache: bool,
}

impl Processor {
    pub fn new(
        embed: EmbedClient,
        chroma: ChromaClient,
        collection_id: String,
        cache: Option<EmbeddingCache>,
        log_cache: bool,
    ) -> Self {
        Self {
            embed,
            chroma,
            collection_id,
            cache,
            log_cache,
        }
    }

    /// Embeds and indexes one snapshot, returning the vector for the caller's
    /// own match query. Cache faults degrade to recompute and never block.
    pub async fn handle(&self, snap: &MarketSnapshot) -> Result<Vec<f32>> {
        let text = build_embedding_text(snap);
        if text.is_empty() {
            bail!("empty embedding text for market {}", snap.market.market_id);
        }

        let key = embedding_cache_key(snap, &text);
        let mut embedding: Option<Vec<f32>> = None;
        let mut cache_miss = false;

        if let Some(cache) = &self.cache {
            match cache.get(&key).await {
                Ok(Some(cached)) => {
                    if self.log_cache {
                        info!("[embed-cache] hit key={key}");
                    }
                    embedding = Some(cached);
                }
                Ok(None) => {
                    cache_miss = true;
                    if self.log_cache {
                        info!("[embed-cache] miss key={key}");
                    }
                }
                Err(err) => {
                    cache_miss = true;
                    warn!("[embed-cache] get error key={key}: {err:#}");
                }
            }
        }

        let embedding = match embedding {
            Some(vector) => vector,
            None => self.embed.embed(&text).await.context("embed")?,
        };

        let metadata = build_metadata(snap, &text);
        let document =
            serde_json::to_string(snap).context("marshal snapshot for vector store")?;
        let id = format!("{}:{}", snap.venue, snap.market.market_id);

        let upsert = UpsertRequest {
            ids: vec![id],
            documents: vec![document],
            metadatas: vec![metadata],
            embeddings: vec![embedding.clone()],
        };
        self.chroma
            .upsert(&self.collection_id, &upsert)
            .await
            .context("vector upsert")?;

        // Store only after a successful upsert, and only on a genuine miss.
        if cache_miss {
            if let Some(cache) = &self.cache {
                if let Err(err) = cache.set(&key, &embedding).await {
                    warn!("[embed-cache] set error key={key}: {err:#}");
                } else if self.log_cache {
                    info!("[embed-cache] stored key={key}");
                }
            }
        }

        Ok(embedding)
    }
}

fn build_metadata(snap: &MarketSnapshot, embedding_text: &str) -> serde_json::Value {
    let mut metadata = serde_json::json!({
        "venue": snap.venue.as_str(),
        "market_id": snap.market.market_id,
        "event_id": snap.event.event_id,
        "captured_at": snap.captured_at.to_rfc3339(),
        "captured_at_unix": snap.captured_at.timestamp(),
        "text_hash": hash_strings([embedding_text]),
        "resolution_hash": hash_strings([
            snap.event.resolution_source.as_str(),
            snap.event.resolution_details.as_str(),
            snap.event.contract_terms_url.as_str(),
        ]),
    });
    if let Some(close_time) = snap.close_time() {
        metadata["close_time"] = serde_json::Value::String(close_time.to_rfc3339());
    }
    metadata
}

/// Compact text used for embedding: title, question (when different), settle
/// date, and the leading sentences of description and subtitle.
pub fn build_embedding_text(snap: &MarketSnapshot) -> String {
    let mut out = String::new();

    if !snap.event.title.is_empty() {
        out.push_str(&snap.event.title);
    }
    if !snap.market.question.is_empty() && snap.market.question != snap.event.title {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&snap.market.question);
    }

    if let Some(close_time) = snap.close_time() {
        out.push_str("\nSettle date: ");
        out.push_str(&close_time.format("%Y-%m-%d").to_string());
    }

    let description = trim_sentences(&snap.event.description, MAX_SENTENCES / 2);
    if !description.is_empty() {
        out.push_str("\nDescription: ");
        out.push_str(&description);
    }

    let subtitle = trim_sentences(&snap.market.subtitle, MAX_SENTENCES);
    if !subtitle.is_empty() {
        out.push_str("\nSubtitle: ");
        out.push_str(&subtitle);
    }

    out.trim().to_string()
}

fn trim_sentences(text: &str, limit: usize) -> String {
    if limit == 0 || text.trim().is_empty() {
        return String::new();
    }
    let sentences = split_sentences(text);
    let take = sentences.len().min(limit);
    sentences[..take].join(" ")
}

/// Naive sentence split on ". ", "? ", "! " with trimming.
fn split_sentences(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return vec![];
    }
    let mut sentences = vec![text.to_string()];
    for delimiter in [". ", "? ", "! "] {
        let mut next = Vec::new();
        for segment in &sentences {
            let parts: Vec<&str> = segment.split(delimiter).collect();
            let count = parts.len();
            for (i, part) in parts.into_iter().enumerate() {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                if i < count - 1 {
                    let mut owned = part.to_string();
                    owned.push(delimiter.chars().next().unwrap());
                    next.push(owned);
                } else {
                    next.push(part.to_string());
                }
            }
        }
        sentences = next;
    }
    sentences
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, Market, Venue};
    use chrono::{TimeZone, Utc};

    fn snap(title: &str, question: &str, description: &str, subtitle: &str) -> MarketSnapshot {
        let event = Event {
            venue: Venue::Kalshi,
            event_id: "KXTEST".into(),
            title: title.into(),
            description: description.into(),
            category: String::new(),
            status: String::new(),
            resolution_source: "AP".into(),
            resolution_details: "rules".into(),
            settlement_sources: vec![],
            contract_terms_url: String::new(),
            close_time: Some(Utc.with_ymd_and_hms(2026, 3, 18, 18, 0, 0).unwrap()),
            markets: vec![],
            raw: None,
        };
        let market = Market {
            market_id: "KXTEST-1".into(),
            question: question.into(),
            subtitle: subtitle.into(),
            ..Market::default()
        };
        MarketSnapshot::new(Venue::Kalshi, &event, market, Utc::now())
    }

    #[test]
    fn test_split_sentences() {
        let parts = split_sentences("First. Second? Third! Fourth");
        assert_eq!(parts, vec!["First.", "Second?", "Third!", "Fourth"]);
    }

    #[test]
    fn test_split_sentences_empty() {
        assert!(split_sentences("").is_empty());
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn test_trim_sentences_caps_length() {
        let text = "One. Two. Three. Four. Five.";
        assert_eq!(trim_sentences(text, 2), "One. Two.");
        assert_eq!(trim_sentences(text, 10), "One. Two. Three. Four. Five.");
        assert_eq!(trim_sentences(text, 0), "");
    }

    #[test]
    fn test_embedding_text_layout() {
        let snapshot = snap(
            "Fed decision",
            "Will the Fed cut rates in March?",
            "First sentence. Second sentence. Third sentence. Fourth sentence.",
            "Subtitle line.",
        );
        let text = build_embedding_text(&snapshot);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Fed decision");
        assert_eq!(lines[1], "Will the Fed cut rates in March?");
        assert_eq!(lines[2], "Settle date: 2026-03-18");
        // description trimmed to MAX_SENTENCES/2 = 3 sentences
        assert_eq!(lines[3], "Description: First sentence. Second sentence. Third sentence.");
        assert_eq!(lines[4], "Subtitle: Subtitle line.");
    }

    #[test]
    fn test_embedding_text_skips_duplicate_question() {
        let snapshot = snap("Same text", "Same text", "", "");
        let text = build_embedding_text(&snapshot);
        assert_eq!(
            text.lines().filter(|line| *line == "Same text").count(),
            1,
            "question equal to title must not repeat"
        );
    }

    #[test]
    fn test_embedding_text_empty_when_no_content() {
        let mut snapshot = snap("", "", "", "");
        snapshot.event.close_time = None;
        assert!(build_embedding_text(&snapshot).is_empty());
    }

    #[test]
    fn test_metadata_carries_content_hashes() {
        let snapshot = snap("Fed decision", "Will the Fed cut rates?", "Desc.", "");
        let text = build_embedding_text(&snapshot);
        let metadata = build_metadata(&snapshot, &text);
        assert_eq!(metadata["venue"], "kalshi");
        assert_eq!(metadata["market_id"], "KXTEST-1");
        assert_eq!(metadata["text_hash"], hash_strings([text.as_str()]));
        assert_eq!(
            metadata["resolution_hash"],
            hash_strings(["AP", "rules", ""])
        );
        assert!(metadata["captured_at_unix"].is_i64());
        assert!(metadata["close_time"].is_string());
    }
}
