//! Polymarket indexing worker: consumes Polymarket snapshots, embeds and
//! indexes them, and emits cross-venue match candidates.
//!
//! Match emission is deliberately one-sided: only this venue's workers wire a
//! matcher and a match producer, so every (Polymarket, Kalshi) pair is
//! traversed exactly once. The canonical pair ID keeps cache lookups
//! direction-independent anyway.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use arb_pipeline::cache::{EmbeddingCache, RedisVerdictCache, VerdictCache};
use arb_pipeline::chroma::ChromaClient;
use arb_pipeline::config::{env_string, env_usize, env_bool, CacheConfig, MatcherConfig};
use arb_pipeline::embed::{EmbedClient, EmbedConfig};
use arb_pipeline::indexer::Processor;
use arb_pipeline::matcher::{Finder, LogMode, MatchLogger};
use arb_pipeline::matches::{MatchPayload, ResolutionVerdict};
use arb_pipeline::types::MarketSnapshot;
use arb_pipeline::{queue, workers};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("arb_pipeline=info".parse().unwrap()),
        )
        .init();

    let shutdown = workers::shutdown_signal();

    let brokers = queue::brokers();
    let topic = queue::topic_from_env("POLYMARKET_KAFKA_TOPIC", queue::DEFAULT_POLY_TOPIC);
    let match_topic = queue::topic_from_env("MATCHES_KAFKA_TOPIC", queue::DEFAULT_MATCH_TOPIC);
    let group = env_string("POLYMARKET_WORKER_GROUP", "polymarket-workers");
    let worker_count = env_usize("POLYMARKET_WORKERS", 2);

    queue::wait_for_broker(&brokers, Duration::from_secs(45))
        .await
        .context("[polymarket-worker] wait for broker")?;
    for ensure in [&topic, &match_topic] {
        if let Err(err) = queue::ensure_topic(&brokers, ensure).await {
            warn!("[polymarket-worker] ensure topic warning: {err:#}");
        }
    }

    let embed_client = EmbedClient::new(EmbedConfig::from_env()?)?;
    let chroma = ChromaClient::from_env()?;
    let collection_name = env_string("CHROMA_COLLECTION", "market_snapshots");
    let collection = tokio::time::timeout(
        Duration::from_secs(30),
        chroma.ensure_collection(&collection_name),
    )
    .await
    .context("[polymarket-worker] ensure collection deadline")?
    .context("[polymarket-worker] ensure chroma collection")?;

    let (embed_cache, verdict_cache): (Option<EmbeddingCache>, Option<Arc<dyn VerdictCache>>) =
        match CacheConfig::from_env() {
            Some(cache_cfg) => (
                Some(
                    EmbeddingCache::connect(&cache_cfg)
                        .await
                        .context("[polymarket-worker] embedding cache")?,
                ),
                Some(Arc::new(
                    RedisVerdictCache::connect(&cache_cfg)
                        .await
                        .context("[polymarket-worker] verdict cache")?,
                )),
            ),
            None => {
                warn!("[polymarket-worker] caches disabled, every embedding recomputes");
                (None, None)
            }
        };

    let processor = Arc::new(Processor::new(
        embed_client,
        chroma.clone(),
        collection.id.clone(),
        embed_cache,
        env_bool("EMBED_CACHE_LOG_HITS", false),
    ));
    let finder = Arc::new(Finder::new(
        chroma,
        collection.id.clone(),
        MatcherConfig::from_env(),
        verdict_cache,
    ));
    let logger = Arc::new(MatchLogger::new(LogMode::parse(&env_string(
        "MATCH_LOG_MODE",
        "summary",
    ))));
    let producer = queue::new_producer(&brokers)?;

    info!("[polymarket-worker] consuming {topic} with group {group} ({worker_count} workers)");
    workers::run::<MarketSnapshot, _, _>(
        shutdown,
        &brokers,
        &topic,
        &group,
        worker_count,
        move |snap: MarketSnapshot| {
            let processor = processor.clone();
            let finder = finder.clone();
            let logger = logger.clone();
            let producer = producer.clone();
            let match_topic = match_topic.clone();
            async move {
                let embedding = processor.handle(&snap).await?;

                let candidate = tokio::time::timeout(
                    Duration::from_secs(15),
                    finder.find_best_match(&snap, &embedding),
                )
                .await
                .context("match query deadline")??;

                if let Some(candidate) = candidate {
                    logger.log_match(&snap, &candidate, finder.threshold());
                    let mut payload = MatchPayload::new(
                        snap.clone(),
                        candidate.target,
                        candidate.similarity,
                        candidate.distance,
                    );
                    if candidate.cached_verdict {
                        payload.cached_verdict = true;
                        payload.resolution_verdict = Some(ResolutionVerdict::new(true, "cached"));
                    }
                    queue::publish_match(&producer, &match_topic, &payload).await?;
                }

                info!(
                    "[polymarket-worker] upserted market={} event={}",
                    snap.market.market_id, snap.event.event_id
                );
                Ok(())
            }
        },
    )
    .await;

    Ok(())
}
