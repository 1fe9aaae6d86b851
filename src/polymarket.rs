//! Polymarket venue client: Gamma events API + CLOB order books.
//!
//! Prices arrive as decimal strings and are parsed straight into [0,1]
//! floats. Placeholder markets (template questions awaiting real teams or
//! candidates) are filtered out during normalization.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::collectors::{backoff, should_retry, Collector, FetchOptions};
use crate::config::{POLYMARKET_API_URL, POLYMARKET_BOOK_URL};
use crate::types::{Event, Level, Market, MarketSnapshot, Orderbook, PriceSnapshot, Venue};

/// Max concurrent CLOB book requests per market.
const BOOK_CONCURRENCY: usize = 4;

/// Optional overrides for the client.
#[derive(Debug, Clone, Default)]
pub struct PolymarketConfig {
    pub base_url: Option<String>,
    pub book_url: Option<String>,
    pub timeout: Option<Duration>,
}

/// Fetches Polymarket events and CLOB depth.
pub struct PolymarketClient {
    base_url: String,
    book_url: String,
    http: reqwest::Client,
    next_offset: usize,
}

impl PolymarketClient {
    pub fn new(cfg: PolymarketConfig) -> Result<Self> {
        let timeout = cfg.timeout.unwrap_or(Duration::from_secs(20));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build polymarket http client")?;
        Ok(Self {
            base_url: cfg.base_url.unwrap_or_else(|| POLYMARKET_API_URL.to_string()),
            book_url: cfg.book_url.unwrap_or_else(|| POLYMARKET_BOOK_URL.to_string()),
            http,
            next_offset: 0,
        })
    }

    /// Fetches one fresh snapshot for a specific market, bypassing pagination.
    /// Used by the final stage right before committing an opportunity.
    pub async fn market_snapshot(&self, event_id: &str, market_id: &str) -> Result<MarketSnapshot> {
        let detail = self.fetch_event(event_id).await?;
        let event = self.normalize_event(&detail).await;
        let market = event
            .markets
            .iter()
            .find(|m| m.market_id == market_id)
            .cloned()
            .with_context(|| format!("market {market_id} not found in event {event_id}"))?;
        Ok(MarketSnapshot::new(Venue::Polymarket, &event, market, Utc::now()))
    }

    async fn list_events(&self, limit: usize, offset: usize) -> Result<Vec<EventSummary>> {
        let url = format!(
            "{}?limit={}&offset={}&closed=false",
            self.base_url, limit, offset
        );
        self.get_json(&url).await
    }

    async fn fetch_event(&self, id: &str) -> Result<EventDetail> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), id);
        self.get_json(&url).await
    }

    async fn fetch_orderbook(&self, token_id: &str) -> Result<Orderbook> {
        let url = format!("{}?token_id={}", self.book_url, token_id);
        let book: ClobBook = self.get_json(&url).await?;
        Ok(convert_clob_book(book))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.http.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp.json().await.context("decode polymarket response");
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !should_retry(attempt, Some(status)) {
                        let body = resp.text().await.unwrap_or_default();
                        let snippet: String = body.chars().take(2048).collect();
                        bail!("polymarket API {status}: {snippet}");
                    }
                }
                Err(err) => {
                    if !should_retry(attempt, None) {
                        return Err(err).context("polymarket request");
                    }
                }
            }
            backoff(attempt).await;
        }
    }

    async fn normalize_event(&self, detail: &EventDetail) -> Event {
        let close_time = parse_rfc3339(&detail.end_date);
        let status = if detail.closed { "closed" } else { "open" };

        let mut markets = Vec::new();
        for market in &detail.markets {
            if is_placeholder_market(market) {
                continue;
            }
            if market.closed || !market.active {
                continue;
            }
            markets.push(self.normalize_market(market).await);
        }

        Event {
            venue: Venue::Polymarket,
            event_id: detail.id.clone(),
            title: detail.title.clone(),
            description: detail.description.clone(),
            category: detail.category.clone(),
            status: status.to_string(),
            resolution_source: detail.resolution_source.clone(),
            resolution_details: detail.resolution_description.clone(),
            settlement_sources: vec![],
            contract_terms_url: String::new(),
            close_time,
            markets,
            raw: serde_json::to_value(detail).ok(),
        }
    }

    async fn normalize_market(&self, market: &ApiMarket) -> Market {
        let clob_ids = parse_clob_token_ids(&market.clob_token_ids);
        let mut orderbooks = std::collections::HashMap::new();

        // Both outcome books fetched concurrently under one deadline
        let ids_to_fetch: Vec<String> = clob_ids
            .iter()
            .filter(|token_id| !token_id.is_empty())
            .cloned()
            .collect();
        let mut fetches = Vec::with_capacity(ids_to_fetch.len());
        for token_id in &ids_to_fetch {
            fetches.push(async move {
                let fetched = tokio::time::timeout(
                    Duration::from_secs(10),
                    self.fetch_orderbook(token_id),
                )
                .await;
                (token_id.clone(), fetched)
            });
        }
        let fetched: Vec<_> = stream::iter(fetches)
            .buffer_unordered(BOOK_CONCURRENCY)
            .collect()
            .await;
        for (token_id, result) in fetched {
            match result {
                Ok(Ok(book)) => {
                    orderbooks.insert(token_id, book);
                }
                Ok(Err(err)) => debug!("[polymarket] book fetch failed token={token_id}: {err:#}"),
                Err(_) => debug!("[polymarket] book fetch timed out token={token_id}"),
            }
        }

        let price = PriceSnapshot {
            yes_bid: best_bid(&orderbooks, &clob_ids, 0),
            yes_ask: best_ask(&orderbooks, &clob_ids, 0),
            no_bid: best_bid(&orderbooks, &clob_ids, 1),
            no_ask: best_ask(&orderbooks, &clob_ids, 1),
        };

        Market {
            market_id: market.id.clone(),
            question: market.question.clone(),
            subtitle: market.description.clone(),
            tick_size: market.min_tick_size,
            close_time: parse_rfc3339(&market.end_date),
            volume: market.volume_num,
            volume_24h: market.volume_24h,
            open_interest: market.open_interest,
            price,
            orderbooks,
            clob_token_ids: clob_ids,
            reference_url: String::new(),
        }
    }
}

#[async_trait]
impl Collector for PolymarketClient {
    fn name(&self) -> &'static str {
        "polymarket"
    }

    /// Retrieves a single page of open events and advances the internal
    /// offset. When the end of results is reached, the offset resets.
    async fn fetch(&mut self, opts: FetchOptions) -> Result<Vec<Event>> {
        let page_size = if opts.page_size == 0 { 50 } else { opts.page_size };

        let list = self
            .list_events(page_size, self.next_offset)
            .await
            .context("polymarket list events")?;
        if list.is_empty() {
            info!("[polymarket] reached end of events, resetting offset");
            self.next_offset = 0;
            return Ok(vec![]);
        }

        info!(
            "[polymarket] processing batch of {} summaries (offset: {})",
            list.len(),
            self.next_offset
        );
        let mut events = Vec::new();
        for summary in &list {
            if summary.closed {
                continue;
            }
            let detail = match self.fetch_event(&summary.id).await {
                Ok(detail) => detail,
                Err(err) => {
                    warn!("[polymarket] skip event {}: {err:#}", summary.id);
                    continue;
                }
            };
            let normalized = self.normalize_event(&detail).await;
            if !normalized.markets.is_empty() {
                events.push(normalized);
            }
        }

        if list.len() < page_size {
            info!("[polymarket] reached end of events, resetting offset");
            self.next_offset = 0;
        } else {
            self.next_offset += page_size;
        }

        Ok(events)
    }
}

// === Wire types ===

#[derive(Debug, Deserialize)]
struct EventSummary {
    id: String,
    #[serde(default)]
    closed: bool,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct EventDetail {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "resolutionSource")]
    resolution_source: String,
    #[serde(default, rename = "resolutionDescription")]
    resolution_description: String,
    #[serde(default)]
    closed: bool,
    #[serde(default)]
    category: String,
    #[serde(default, rename = "endDate")]
    end_date: String,
    #[serde(default)]
    markets: Vec<ApiMarket>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct ApiMarket {
    id: String,
    #[serde(default)]
    question: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "volumeNum")]
    volume_num: f64,
    #[serde(default, rename = "volume24hr")]
    volume_24h: f64,
    #[serde(default, rename = "openInterest")]
    open_interest: f64,
    #[serde(default, rename = "clobTokenIds")]
    clob_token_ids: String,
    #[serde(default, rename = "orderPriceMinTickSize")]
    min_tick_size: f64,
    #[serde(default, rename = "endDate")]
    end_date: String,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct ClobBook {
    #[serde(default)]
    bids: Vec<ClobLevel>,
    #[serde(default)]
    asks: Vec<ClobLevel>,
}

#[derive(Debug, Deserialize)]
struct ClobLevel {
    #[serde(default)]
    price: String,
    #[serde(default)]
    size: String,
}

// === Helpers ===

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// The Gamma API encodes token IDs as a JSON array inside a string field.
fn parse_clob_token_ids(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return vec![];
    }
    serde_json::from_str(raw).unwrap_or_default()
}

fn convert_clob_book(book: ClobBook) -> Orderbook {
    let convert = |levels: Vec<ClobLevel>| {
        levels
            .into_iter()
            .map(|level| {
                let price = level.price.parse::<f64>().unwrap_or(0.0);
                let size = level.size.parse::<f64>().unwrap_or(0.0);
                Level {
                    price,
                    quantity: size,
                    raw_price: price,
                    raw_amount: size,
                }
            })
            .collect()
    };
    Orderbook {
        bids: convert(book.bids),
        asks: convert(book.asks),
    }
}

fn best_bid(
    orderbooks: &std::collections::HashMap<String, Orderbook>,
    clob_ids: &[String],
    idx: usize,
) -> f64 {
    clob_ids
        .get(idx)
        .and_then(|token| orderbooks.get(token))
        .and_then(|book| book.bids.first())
        .map(|level| level.price)
        .unwrap_or(0.0)
}

fn best_ask(
    orderbooks: &std::collections::HashMap<String, Orderbook>,
    clob_ids: &[String],
    idx: usize,
) -> f64 {
    clob_ids
        .get(idx)
        .and_then(|token| orderbooks.get(token))
        .and_then(|book| book.asks.first())
        .map(|level| level.price)
        .unwrap_or(0.0)
}

fn placeholder_question_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^will\s+\w+\s+[a-z]\b").unwrap())
}

/// Template markets awaiting real entities ("Will <TBD> w ...") never resolve
/// as listed; skip them during normalization.
fn is_placeholder_market(market: &ApiMarket) -> bool {
    let question = market.question.trim();
    if placeholder_question_re().is_match(question) {
        return true;
    }
    let desc = market.description.to_lowercase();
    desc.contains("may be updated to replace") || desc.contains("placeholder")
}

// =============================================================================
// TESTS
// =============================================================================
