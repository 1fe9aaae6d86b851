//! Kafka topic plumbing: broker discovery, topic creation, producers,
//! consumer groups, and the snapshot publisher.
//!
//! Offsets are committed periodically (1 s), so delivery is at-least-once;
//! every downstream consumer is idempotent (keyed vector upserts, verdict
//! cache, append-only opportunity rows).

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tracing::info;

use crate::config::env_string;
use crate::types::{Event, MarketSnapshot, Venue};

pub const DEFAULT_BROKERS: &str = "localhost:9092";
pub const DEFAULT_POLY_TOPIC: &str = "polymarket.snapshots";
pub const DEFAULT_KALSHI_TOPIC: &str = "kalshi.snapshots";
pub const DEFAULT_MATCH_TOPIC: &str = "matches";

const TOPIC_PARTITIONS: i32 = 3;

/// Comma-separated broker list from `KAFKA_BROKERS`.
pub fn brokers() -> String {
    env_string("KAFKA_BROKERS", DEFAULT_BROKERS)
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn topic_from_env(env_key: &str, fallback: &str) -> String {
    env_string(env_key, fallback)
}

/// Blocks until the broker answers a metadata probe or the deadline passes.
pub async fn wait_for_broker(brokers: &str, deadline: Duration) -> Result<()> {
    if brokers.is_empty() {
        bail!("no brokers configured");
    }
    let started = Instant::now();
    loop {
        let brokers_owned = brokers.to_string();
        let probe = tokio::task::spawn_blocking(move || -> Result<()> {
            let consumer: rdkafka::consumer::BaseConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers_owned)
                .create()
                .context("create probe consumer")?;
            consumer
                .fetch_metadata(None, Duration::from_secs(5))
                .context("fetch metadata")?;
            Ok(())
        })
        .await
        .context("join probe task")?;

        match probe {
            Ok(()) => return Ok(()),
            Err(err) => {
                if started.elapsed() >= deadline {
                    return Err(err).context("waiting for broker");
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Creates the topic if it does not exist (3 partitions, replication 1).
pub async fn ensure_topic(brokers: &str, topic: &str) -> Result<()> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .create()
        .context("create admin client")?;

    let new_topic = NewTopic::new(topic, TOPIC_PARTITIONS, TopicReplication::Fixed(1));
    let opts = AdminOptions::new().operation_timeout(Some(Timeout::After(Duration::from_secs(30))));
    let results = admin
        .create_topics([&new_topic], &opts)
        .await
        .context("create topic")?;

    for result in results {
        match result {
            Ok(_) => {}
            Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
            Err((name, code)) => bail!("create topic {name}: {code}"),
        }
    }
    Ok(())
}

pub fn new_producer(brokers: &str) -> Result<FutureProducer> {
    ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "10000")
        .set("queue.buffering.max.ms", "100")
        .set("acks", "1")
        .create()
        .context("create producer")
}

/// One reader handle in a consumer group. Partitions are divided by the
/// broker's own assignment protocol; offsets auto-commit every second.
pub fn new_consumer(brokers: &str, topic: &str, group: &str) -> Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", group)
        .set("enable.auto.commit", "true")
        .set("auto.commit.interval.ms", "1000")
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", "30000")
        .set("heartbeat.interval.ms", "3000")
        .create()
        .context("create consumer")?;
    consumer
        .subscribe(&[topic])
        .with_context(|| format!("subscribe to {topic}"))?;
    Ok(consumer)
}

/// Wraps every market of every event in a `MarketSnapshot` and appends it to
/// the venue's snapshot topic, keyed `venue-market_id-captured_at_ns`.
pub async fn publish_snapshots(
    producer: &FutureProducer,
    topic: &str,
    venue: Venue,
    events: &[Event],
) -> Result<usize> {
    let captured = Utc::now();
    let mut published = 0usize;

    for event in events {
        for market in &event.markets {
            let snapshot = MarketSnapshot::new(venue, event, market.clone(), captured);
            let key = format!(
                "{}-{}-{}",
                venue,
                snapshot.market.market_id,
                captured.timestamp_nanos_opt().unwrap_or_default()
            );
            let payload = serde_json::to_vec(&snapshot)
                .with_context(|| format!("marshal snapshot {}", snapshot.market.market_id))?;

            let record = FutureRecord::to(topic).key(&key).payload(&payload);
            producer
                .send(record, Timeout::After(Duration::from_secs(10)))
                .await
                .map_err(|(err, _): (KafkaError, _)| err)
                .with_context(|| format!("publish snapshot {key}"))?;
            published += 1;
        }
    }

    if published > 0 {
        info!("[{venue}] published {published} snapshots to {topic}");
    }
    Ok(published)
}

/// Publishes a match payload keyed by its canonical pair ID.
pub async fn publish_match(
    producer: &FutureProducer,
    topic: &str,
    payload: &crate::matches::MatchPayload,
) -> Result<()> {
    let data = serde_json::to_vec(payload).context("marshal match payload")?;
    let record = FutureRecord::to(topic).key(&payload.pair_id).payload(&data);
    producer
        .send(record, Timeout::After(Duration::from_secs(10)))
        .await
        .map_err(|(err, _): (KafkaError, _)| err)
        .with_context(|| format!("publish match {}", payload.pair_id))?;
    Ok(())
}
