//! Consumer-group worker pool shared by every pipeline stage.
//!
//! Each worker owns one reader handle; the broker divides partitions across
//! the group, so two workers never receive the same message. Decode faults
//! skip the message without crashing the worker. On shutdown, in-flight
//! handlers finish their current message before the task exits.

use std::future::Future;

use anyhow::Result;
use rdkafka::consumer::StreamConsumer;
use rdkafka::Message;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{error, info};

use crate::queue;

/// Watch-channel shutdown signal wired to SIGINT. Every stage holds a
/// receiver clone and drains promptly when it flips.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        let _ = tx.send(true);
    });
    rx
}

/// Runs `worker_count` consumers in the given group, decoding each message as
/// `T` and dispatching to the handler. Returns once shutdown fires and all
/// workers have drained.
pub async fn run<T, F, Fut>(
    shutdown: watch::Receiver<bool>,
    brokers: &str,
    topic: &str,
    group: &str,
    worker_count: usize,
    handler: F,
) where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    let worker_count = worker_count.max(1);
    let mut handles = Vec::with_capacity(worker_count);

    for id in 0..worker_count {
        let consumer = match queue::new_consumer(brokers, topic, group) {
            Ok(consumer) => consumer,
            Err(err) => {
                error!("worker {id}: consumer setup failed: {err:#}");
                continue;
            }
        };
        let handler = handler.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            consume::<T, F, Fut>(shutdown, consumer, handler).await;
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
}

async fn consume<T, F, Fut>(mut shutdown: watch::Receiver<bool>, consumer: StreamConsumer, handler: F)
where
    T: DeserializeOwned,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        if *shutdown.borrow() {
            return;
        }
        let received = tokio::select! {
            _ = shutdown.changed() => return,
            received = consumer.recv() => received,
        };
        // Decode in a scope of its own: the borrowed message is released
        // before the handler suspends.
        let decoded: T = {
            let message = match received {
                Ok(message) => message,
                Err(err) => {
                    error!("worker read error: {err}");
                    continue;
                }
            };
            let Some(payload) = message.payload() else {
                continue;
            };
            match serde_json::from_slice(payload) {
                Ok(decoded) => decoded,
                Err(err) => {
                    error!("worker unmarshal error: {err}");
                    continue;
                }
            }
        };
        if let Err(err) = handler(decoded).await {
            error!("worker handler error: {err:#}");
        }
    }
}
