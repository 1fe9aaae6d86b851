//! Kalshi indexing worker: consumes Kalshi snapshots and embeds/indexes them
//! into the vector store. This side never emits matches; pair emission is the
//! Polymarket workers' job.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use arb_pipeline::cache::EmbeddingCache;
use arb_pipeline::chroma::ChromaClient;
use arb_pipeline::config::{env_bool, env_string, env_usize, CacheConfig};
use arb_pipeline::embed::{EmbedClient, EmbedConfig};
use arb_pipeline::indexer::Processor;
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
    let topic = queue::topic_from_env("KALSHI_KAFKA_TOPIC", queue::DEFAULT_KALSHI_TOPIC);
    let group = env_string("KALSHI_WORKER_GROUP", "kalshi-workers");
    let worker_count = env_usize("KALSHI_WORKERS", 2);

    queue::wait_for_broker(&brokers, Duration::from_secs(45))
        .await
        .context("[kalshi-worker] wait for broker")?;
    if let Err(err) = queue::ensure_topic(&brokers, &topic).await {
        warn!("[kalshi-worker] ensure topic warning: {err:#}");
    }

    let embed_client = EmbedClient::new(EmbedConfig::from_env()?)?;
    let chroma = ChromaClient::from_env()?;
    let collection_name = env_string("CHROMA_COLLECTION", "market_snapshots");
    let collection = tokio::time::timeout(
        Duration::from_secs(30),
        chroma.ensure_collection(&collection_name),
    )
    .await
    .context("[kalshi-worker] ensure collection deadline")?
    .context("[kalshi-worker] ensure chroma collection")?;

    let embed_cache = match CacheConfig::from_env() {
        Some(cache_cfg) => Some(
            EmbeddingCache::connect(&cache_cfg)
                .await
                .context("[kalshi-worker] embedding cache")?,
        ),
        None => {
            warn!("[kalshi-worker] caches disabled, every embedding recomputes");
            None
        }
    };

    let processor = Arc::new(Processor::new(
        embed_client,
        chroma,
        collection.id.clone(),
        embed_cache,
        env_bool("EMBED_CACHE_LOG_HITS", false),
    ));

    info!("[kalshi-worker] consuming {topic} with group {group} ({worker_count} workers)");
    workers::run::<MarketSnapshot, _, _>(
        shutdown,
        &brokers,
        &topic,
        &group,
        worker_count,
        move |snap: MarketSnapshot| {
            let processor = processor.clone();
            async move {
                processor.handle(&snap).await?;
                info!(
                    "[kalshi-worker] upserted market={} event={}",
                    snap.market.market_id, snap.event.event_id
                );
                Ok(())
            }
        },
    )
    .await;

    Ok(())
}
