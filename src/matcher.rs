//! Cross-venue nearest-neighbor matcher.
//!
//! After a venue P snapshot is indexed, the just-computed vector is queried
//! against the opposite venue's rows with a freshness cutoff. Candidates are
//! walked in similarity order; the loop breaks at the first one below the
//! threshold (strictly `similarity < threshold` rejects). The verdict cache
//! is consulted before emission: cached-UNSAFE pairs are skipped silently,
//! cached-SAFE pairs are emitted pre-verdicted.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::cache::VerdictCache;
use crate::chroma::{venue_freshness_filter, ChromaClient, QueryRequest, QueryResponse};
use crate::config::MatcherConfig;
use crate::hash::verdict_cache_key;
use crate::types::MarketSnapshot;

/// A candidate pairing produced by the matcher.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub target: MarketSnapshot,
    pub similarity: f64,
    pub distance: f64,
    /// True when the verdict cache already holds SAFE for this pair.
    pub cached_verdict: bool,
}

pub struct Finder {
    chroma: ChromaClient,
    collection_id: String,
    cfg: MatcherConfig,
    verdict_cache: Option<Arc<dyn VerdictCache>>,
}

impl Finder {
    pub fn new(
        chroma: ChromaClient,
        collection_id: String,
        cfg: MatcherConfig,
        verdict_cache: Option<Arc<dyn VerdictCache>>,
    ) -> Self {
        Self {
            chroma,
            collection_id,
            cfg,
            verdict_cache,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.cfg.threshold
    }

    /// Queries the opposite venue's index for the best fresh candidate above
    /// the similarity threshold. Emits at most one match per source snapshot.
    pub async fn find_best_match(
        &self,
        snap: &MarketSnapshot,
        embedding: &[f32],
    ) -> Result<Option<MatchCandidate>> {
        if embedding.is_empty() {
            return Ok(None);
        }

        let target_venue = snap.venue.opposite();
        let freshness = self.cfg.freshness;
        let cutoff = if freshness > Duration::ZERO {
            let window =
                chrono::Duration::from_std(freshness).unwrap_or_else(|_| chrono::Duration::zero());
            Some(Utc::now() - window)
        } else {
            None
        };

        let query = QueryRequest {
            query_embeddings: vec![embedding.to_vec()],
            n_results: self.cfg.top_k,
            where_filter: Some(venue_freshness_filter(
                target_venue.as_str(),
                cutoff.map(|c| c.timestamp()),
            )),
            include: vec!["documents".into(), "metadatas".into(), "distances".into()],
        };
        if self.cfg.debug {
            debug!(
                "[matcher] query venue={} market={} top_k={} threshold={}",
                snap.venue, snap.market.market_id, self.cfg.top_k, self.cfg.threshold
            );
        }

        let resp = self
            .chroma
            .query(&self.collection_id, &query)
            .await
            .context("matcher query")?;
        self.select_candidate(snap, &resp, cutoff).await
    }

    /// Walks query hits in similarity order and applies the threshold break,
    /// the freshness re-check, and the verdict-cache gate. Split from the
    /// query call so the gating logic is exercisable without a vector store.
    async fn select_candidate(
        &self,
        snap: &MarketSnapshot,
        resp: &QueryResponse,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Option<MatchCandidate>> {
        let documents = match resp.documents.first() {
            Some(row) if !row.is_empty() => row,
            _ => {
                if self.cfg.debug {
                    debug!(
                        "[matcher] no documents from query venue={} market={}",
                        snap.venue, snap.market.market_id
                    );
                }
                return Ok(None);
            }
        };

        for (idx, document) in documents.iter().enumerate() {
            let distance = resp.distance_at(idx);
            let similarity = 1.0 - distance;
            if similarity < self.cfg.threshold {
                break;
            }

            let target: MarketSnapshot =
                serde_json::from_str(document).context("decode match snapshot")?;

            if let Some(cutoff) = cutoff {
                if target.captured_at < cutoff {
                    if self.cfg.debug {
                        debug!(
                            "[matcher] skipped stale candidate {} captured_at={}",
                            target.market.market_id, target.captured_at
                        );
                    }
                    continue;
                }
            }

            if self.cfg.debug {
                debug!(
                    "[matcher] candidate source={} candidate={} similarity={similarity:.4}",
                    snap.market.market_id, target.market.market_id
                );
            }

            match self.check_verdict_cache(snap, &target).await {
                CachedVerdict::Unsafe => continue,
                CachedVerdict::Safe => {
                    return Ok(Some(MatchCandidate {
                        target,
                        similarity,
                        distance,
                        cached_verdict: true,
                    }));
                }
                CachedVerdict::Unknown => {
                    return Ok(Some(MatchCandidate {
                        target,
                        similarity,
                        distance,
                        cached_verdict: false,
                    }));
                }
            }
        }

        Ok(None)
    }

    async fn check_verdict_cache(
        &self,
        source: &MarketSnapshot,
        target: &MarketSnapshot,
    ) -> CachedVerdict {
        let Some(cache) = &self.verdict_cache else {
            return CachedVerdict::Unknown;
        };
        let key = verdict_cache_key(source, target);
        match cache.get(&key).await {
            Ok(Some(true)) => {
                info!("[verdict-cache] hit SAFE key={key}");
                CachedVerdict::Safe
            }
            Ok(Some(false)) => {
                info!("[verdict-cache] hit UNSAFE key={key}");
                CachedVerdict::Unsafe
            }
            Ok(None) => {
                info!("[verdict-cache] miss key={key}");
                CachedVerdict::Unknown
            }
            Err(err) => {
                // cache faults never block the pipeline
                error!("[verdict-cache] get error key={key}: {err:#}");
                CachedVerdict::Unknown
            }
        }
    }
}

enum CachedVerdict {
    Safe,
    Unsafe,
    Unknown,
}

// === Match logging ===

/// How loudly matches are reported alongside the structured log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Quiet,
    Summary,
    Verbose,
}

impl LogMode {
    pub fn parse(input: &str) -> LogMode {
        match input.to_lowercase().as_str() {
            "summary" => LogMode::Summary,
            "verbose" => LogMode::Verbose,
            _ => LogMode::Quiet,
        }
    }
}

pub struct MatchLogger {
    mode: LogMode,
}

impl MatchLogger {
    pub fn new(mode: LogMode) -> Self {
        Self { mode }
    }

    /// Reports a match and appends a structured entry to `matches.log`.
    pub fn log_match(&self, source: &MarketSnapshot, candidate: &MatchCandidate, threshold: f64) {
        if self.mode == LogMode::Quiet {
            return;
        }
        match self.mode {
            LogMode::Summary => info!(
                "[matcher] matched {} ({}) -> {} ({}) sim={:.4} threshold={:.4}",
                source.venue,
                safe_question(source),
                candidate.target.venue,
                safe_question(&candidate.target),
                candidate.similarity,
                threshold
            ),
            LogMode::Verbose => info!(
                "[matcher] match sim={:.4} threshold={:.4}\nsource={}\nmatch={}",
                candidate.similarity,
                threshold,
                serde_json::to_string_pretty(source).unwrap_or_default(),
                serde_json::to_string_pretty(&candidate.target).unwrap_or_default()
            ),
            LogMode::Quiet => {}
        }
        self.append_to_file(source, candidate, threshold);
    }

    fn append_to_file(&self, source: &MarketSnapshot, candidate: &MatchCandidate, threshold: f64) {
        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "similarity": candidate.similarity,
            "threshold": threshold,
            "source": source,
            "target": candidate.target,
        });
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                error!("[matcher] log file marshal error: {err}");
                return;
            }
        };
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open("matches.log");
        match file {
            Ok(mut file) => {
                if let Err(err) = writeln!(file, "{line}") {
                    error!("[matcher] log file write error: {err}");
                }
            }
            Err(err) => error!("[matcher] log file open error: {err}"),
        }
    }
}

fn safe_question(snap: &MarketSnapshot) -> &str {
    if !snap.market.question.is_empty() {
        &snap.market.question
    } else if !snap.event.title.is_empty() {
        &snap.event.title
    } else {
        &snap.market.market_id
    }
}

// =============================================================================
// TESTS
// =============================================================================
