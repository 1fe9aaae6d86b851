//! Venue collector contract and the shared polling loop.
//!
//! A collector fetches one page of open events per call, maintaining its own
//! pagination cursor and resetting at the end. Rate limiting and retry/backoff
//! live inside each venue client's HTTP layer.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::watch;
use tracing::error;

use crate::types::Event;

/// Controls how many items a collector should fetch per run.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub page_size: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self { page_size: 20 }
    }
}

/// Implemented by venue-specific collectors. Each is responsible for
/// fetching, normalizing, and returning events that fit the options.
#[async_trait]
pub trait Collector: Send {
    fn name(&self) -> &'static str;
    async fn fetch(&mut self, opts: FetchOptions) -> Result<Vec<Event>>;
}

/// Continuously fetches from a collector and hands each non-empty batch to
/// `handle`. Polls again immediately after each iteration; returns when the
/// shutdown signal fires.
pub async fn run_loop<C, F, Fut>(
    mut shutdown: watch::Receiver<bool>,
    collector: &mut C,
    opts: FetchOptions,
    mut handle: F,
) where
    C: Collector + ?Sized,
    F: FnMut(Vec<Event>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    loop {
        if *shutdown.borrow() {
            return;
        }
        let events = tokio::select! {
            _ = shutdown.changed() => return,
            fetched = collector.fetch(opts) => fetched,
        };
        match events {
            Err(err) => error!("[{}] fetch failed: {err:#}", collector.name()),
            Ok(events) if !events.is_empty() => {
                if let Err(err) = handle(events).await {
                    error!("[{}] handler error: {err:#}", collector.name());
                }
            }
            Ok(_) => {}
        }
    }
}

// === Shared HTTP retry policy for venue clients ===

pub(crate) const MAX_HTTP_ATTEMPTS: u32 = 5;

/// Transient faults only: connect errors, 429, and 5xx.
pub(crate) fn should_retry(attempt: u32, status: Option<StatusCode>) -> bool {
    if attempt >= MAX_HTTP_ATTEMPTS {
        return false;
    }
    match status {
        None => true,
        Some(status) => status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
    }
}

/// Exponential backoff: 1s, 2s, 4s, ... capped at 30s.
pub(crate) async fn backoff(attempt: u32) {
    let secs = 1u64 << (attempt.saturating_sub(1)).min(5);
    tokio::time::sleep(Duration::from_secs(secs.min(30))).await;
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_on_transient_faults() {
        assert!(should_retry(1, None), "connect errors retry");
        assert!(should_retry(1, Some(StatusCode::TOO_MANY_REQUESTS)));
        assert!(should_retry(1, Some(StatusCode::INTERNAL_SERVER_ERROR)));
        assert!(should_retry(4, Some(StatusCode::BAD_GATEWAY)));
    }

    #[test]
    fn test_no_retry_on_client_errors() {
        assert!(!should_retry(1, Some(StatusCode::NOT_FOUND)));
        assert!(!should_retry(1, Some(StatusCode::UNAUTHORIZED)));
        assert!(!should_retry(1, Some(StatusCode::BAD_REQUEST)));
    }

    #[test]
    fn test_retry_exhausts_after_five_attempts() {
        assert!(should_retry(4, None));
        assert!(!should_retry(5, None));
        assert!(!should_retry(5, Some(StatusCode::SERVICE_UNAVAILABLE)));
    }
}
