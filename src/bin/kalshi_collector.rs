//! Kalshi collector: polls the venue, persists markets, and publishes one
//! snapshot per market to the venue's Kafka topic.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use arb_pipeline::collectors::{self, FetchOptions};
use arb_pipeline::config::{env_string, env_usize};
use arb_pipeline::kalshi::{KalshiClient, KalshiConfig};
use arb_pipeline::types::Venue;
use arb_pipeline::{queue, storage, workers};

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
    let store = storage::create_storage_channel(&env_string("SQLITE_PATH", "data/arb.db"));

    let brokers = queue::brokers();
    let topic = queue::topic_from_env("KALSHI_KAFKA_TOPIC", queue::DEFAULT_KALSHI_TOPIC);

    queue::wait_for_broker(&brokers, Duration::from_secs(45))
        .await
        .context("[kalshi] kafka unavailable")?;
    if let Err(err) = queue::ensure_topic(&brokers, &topic).await {
        warn!("[kalshi] ensure topic warning: {err:#}");
    }
    let producer = queue::new_producer(&brokers)?;

    let mut collector = KalshiClient::new(KalshiConfig::default())?;
    let opts = FetchOptions {
        page_size: env_usize("KALSHI_PAGE_SIZE", 20),
    };

    info!("[kalshi] collector started (topic={topic}, page_size={})", opts.page_size);
    collectors::run_loop(shutdown, &mut collector, opts, |events| {
        let store = store.clone();
        let producer = producer.clone();
        let topic = topic.clone();
        async move {
            info!("[kalshi] fetched {} events", events.len());
            store.record_events(Venue::Kalshi, events.clone());
            if let Err(err) =
                queue::publish_snapshots(&producer, &topic, Venue::Kalshi, &events).await
            {
                warn!("[kalshi] publish error: {err:#}");
            }
            Ok(())
        }
    })
    .await;

    store.shutdown();
    Ok(())
}
