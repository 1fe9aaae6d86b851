//! Kalshi venue client: Trade API events, series metadata, and order books.
//!
//! Kalshi reports integer cents; normalization divides by 100 so every price
//! downstream is a decimal probability. The API publishes only resting bids
//! per side, so each side's asks are synthesized from the opposite side's
//! bids via `1 - price`, clamped to [0,1], with raw cents preserved.

use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::collectors::{backoff, should_retry, Collector, FetchOptions};
use crate::config::{env_u64, KALSHI_API_URL, KALSHI_MARKET_URL, KALSHI_SERIES_URL};
use crate::types::{
    Event, Level, Market, MarketSnapshot, Orderbook, PriceSnapshot, ResolutionSource, Venue,
};

/// Optional overrides for the client.
#[derive(Debug, Clone, Default)]
pub struct KalshiConfig {
    pub base_url: Option<String>,
    pub series_url: Option<String>,
    pub book_url: Option<String>,
    pub timeout: Option<Duration>,
}

/// Talks to the Kalshi Trade API. Kalshi rate limits aggressively, so all
/// calls go through a conservative per-second limiter.
pub struct KalshiClient {
    base_url: String,
    series_url: String,
    book_url: String,
    http: reqwest::Client,
    limiter: DefaultDirectRateLimiter,
    next_cursor: String,
}

impl KalshiClient {
    pub fn new(cfg: KalshiConfig) -> Result<Self> {
        let timeout = cfg.timeout.unwrap_or(Duration::from_secs(20));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build kalshi http client")?;
        let per_second = env_u64("KALSHI_RATE_LIMIT_PER_SEC", 4).max(1) as u32;
        let quota = Quota::per_second(NonZeroU32::new(per_second).unwrap());
        Ok(Self {
            base_url: cfg.base_url.unwrap_or_else(|| KALSHI_API_URL.to_string()),
            series_url: cfg.series_url.unwrap_or_else(|| KALSHI_SERIES_URL.to_string()),
            book_url: cfg.book_url.unwrap_or_else(|| KALSHI_MARKET_URL.to_string()),
            http,
            limiter: RateLimiter::direct(quota),
            next_cursor: String::new(),
        })
    }

    /// Fetches one fresh snapshot for a specific market, bypassing the cursor.
    pub async fn market_snapshot(&self, event_id: &str, market_id: &str) -> Result<MarketSnapshot> {
        let detail = self.fetch_event(event_id).await?;
        let series = self.fetch_series(&detail.event.series_ticker).await.ok();
        let event = self.normalize_event(&detail, series.as_ref()).await;
        let market = event
            .markets
            .iter()
            .find(|m| m.market_id == market_id)
            .cloned()
            .with_context(|| format!("market {market_id} not found in event {event_id}"))?;
        Ok(MarketSnapshot::new(Venue::Kalshi, &event, market, Utc::now()))
    }

    async fn list_events(&self, limit: usize, cursor: &str) -> Result<EventsResponse> {
        let mut url = format!("{}?limit={}&status=open", self.base_url, limit);
        if !cursor.is_empty() {
            url.push_str("&cursor=");
            url.push_str(cursor);
        }
        self.get_json(&url).await
    }

    async fn fetch_event(&self, ticker: &str) -> Result<EventDetail> {
        let url = format!(
            "{}/{}?with_nested_markets=true",
            self.base_url.trim_end_matches('/'),
            ticker
        );
        self.get_json(&url).await
    }

    async fn fetch_series(&self, ticker: &str) -> Result<SeriesResponse> {
        let url = format!("{}/{}", self.series_url.trim_end_matches('/'), ticker);
        self.get_json(&url).await
    }

    async fn fetch_orderbooks(
        &self,
        ticker: &str,
    ) -> Result<std::collections::HashMap<String, Orderbook>> {
        let url = format!(
            "{}/{}/orderbook?depth=5",
            self.book_url.trim_end_matches('/'),
            ticker
        );
        let book: OrderbookResponse = self.get_json(&url).await?;

        let yes_bids = convert_levels(&book.yes);
        let no_bids = convert_levels(&book.no);

        let yes_book = Orderbook {
            asks: derive_asks_from_opposite(&no_bids),
            bids: yes_bids.clone(),
        };
        let no_book = Orderbook {
            asks: derive_asks_from_opposite(&yes_bids),
            bids: no_bids,
        };

        let mut out = std::collections::HashMap::new();
        out.insert("yes".to_string(), yes_book);
        out.insert("no".to_string(), no_book);
        Ok(out)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.until_ready().await;
            match self.http.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp.json().await.context("decode kalshi response");
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !should_retry(attempt, Some(status)) {
                        let body = resp.text().await.unwrap_or_default();
                        let snippet: String = body.chars().take(2048).collect();
                        bail!("kalshi API {status}: {snippet}");
                    }
                }
                Err(err) => {
                    if !should_retry(attempt, None) {
                        return Err(err).context("kalshi request");
                    }
                }
            }
            backoff(attempt).await;
        }
    }

    async fn normalize_event(
        &self,
        detail: &EventDetail,
        series: Option<&SeriesResponse>,
    ) -> Event {
        let ev = &detail.event;
        let settlement: Vec<ResolutionSource> = series
            .map(|s| {
                s.series
                    .settlement_sources
                    .iter()
                    .map(|src| ResolutionSource {
                        name: src.name.clone(),
                        url: src.url.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut markets = Vec::new();
        let source_markets = if detail.markets.is_empty() {
            &ev.markets
        } else {
            &detail.markets
        };
        for market in source_markets {
            if market.status != "active" {
                continue;
            }
            markets.push(self.normalize_market(ev, market, series).await);
        }

        Event {
            venue: Venue::Kalshi,
            event_id: ev.event_ticker.clone(),
            title: ev.title.clone(),
            description: ev.description.clone(),
            category: ev.category.clone(),
            status: ev.status.clone(),
            resolution_source: ev.settlement_sources.join(", "),
            resolution_details: format!("{}\n{}", ev.rules_primary, ev.rules_secondary)
                .trim()
                .to_string(),
            settlement_sources: settlement,
            contract_terms_url: series
                .map(|s| s.series.contract_terms_url.clone())
                .unwrap_or_default(),
            close_time: parse_rfc3339(&ev.close_time),
            markets,
            raw: serde_json::to_value(detail).ok(),
        }
    }

    async fn normalize_market(
        &self,
        ev: &ApiEvent,
        market: &ApiMarket,
        series: Option<&SeriesResponse>,
    ) -> Market {
        let orderbooks = match tokio::time::timeout(
            Duration::from_secs(10),
            self.fetch_orderbooks(&market.ticker),
        )
        .await
        {
            Ok(Ok(books)) => books,
            Ok(Err(err)) => {
                debug!("[kalshi] book fetch failed ticker={}: {err:#}", market.ticker);
                std::collections::HashMap::new()
            }
            Err(_) => {
                debug!("[kalshi] book fetch timed out ticker={}", market.ticker);
                std::collections::HashMap::new()
            }
        };

        Market {
            market_id: market.ticker.clone(),
            question: derive_question(&ev.title, market),
            subtitle: market.sub_title.clone(),
            tick_size: cents_to_float(market.tick_size),
            close_time: parse_rfc3339(&market.close_time),
            volume: market.volume as f64,
            volume_24h: market.volume_24h as f64,
            open_interest: market.open_interest as f64,
            price: PriceSnapshot {
                yes_bid: cents_to_float(market.yes_bid),
                yes_ask: cents_to_float(market.yes_ask),
                no_bid: cents_to_float(market.no_bid),
                no_ask: cents_to_float(market.no_ask),
            },
            orderbooks,
            clob_token_ids: vec![],
            reference_url: series
                .map(|s| s.series.contract_url.clone())
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Collector for KalshiClient {
    fn name(&self) -> &'static str {
        "kalshi"
    }

    /// Retrieves a single page of open events and advances the internal
    /// cursor. When the end is reached, the cursor resets to start over.
    async fn fetch(&mut self, opts: FetchOptions) -> Result<Vec<Event>> {
        let page_size = match opts.page_size {
            0 => 100,
            n => n.min(200), // API limit
        };

        let resp = self
            .list_events(page_size, &self.next_cursor)
            .await
            .context("list kalshi events")?;

        info!(
            "[kalshi] processing batch of {} events (cursor: {})",
            resp.events.len(),
            self.next_cursor
        );
        let mut events = Vec::new();
        for summary in &resp.events {
            let detail = match self.fetch_event(&summary.event_ticker).await {
                Ok(detail) => detail,
                Err(err) => {
                    warn!("[kalshi] skip event {}: {err:#}", summary.event_ticker);
                    continue;
                }
            };
            let series = match self.fetch_series(&summary.series_ticker).await {
                Ok(series) => Some(series),
                Err(err) => {
                    warn!(
                        "[kalshi] skip series {} for event {}: {err:#}",
                        summary.series_ticker, summary.event_ticker
                    );
                    continue;
                }
            };
            events.push(self.normalize_event(&detail, series.as_ref()).await);
        }

        self.next_cursor = resp.cursor;
        if self.next_cursor.is_empty() {
            info!("[kalshi] reached end of events, resetting cursor");
        }

        Ok(events)
    }
}

// === Wire types ===

#[derive(Debug, Deserialize)]
struct EventsResponse {
    #[serde(default)]
    events: Vec<ApiEvent>,
    #[serde(default)]
    cursor: String,
}

#[derive(Debug, Default, Deserialize, serde::Serialize)]
struct ApiEvent {
    #[serde(default)]
    event_ticker: String,
    #[serde(default)]
    series_ticker: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    sub_title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    close_time: String,
    #[serde(default)]
    settlement_sources: Vec<String>,
    #[serde(default)]
    rules_primary: String,
    #[serde(default)]
    rules_secondary: String,
    #[serde(default)]
    markets: Vec<ApiMarket>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct EventDetail {
    event: ApiEvent,
    #[serde(default)]
    markets: Vec<ApiMarket>,
}

#[derive(Debug, Default, Deserialize, serde::Serialize)]
struct ApiMarket {
    #[serde(default)]
    ticker: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    sub_title: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    yes_ask: i64,
    #[serde(default)]
    yes_bid: i64,
    #[serde(default)]
    no_ask: i64,
    #[serde(default)]
    no_bid: i64,
    #[serde(default)]
    volume: i64,
    #[serde(default)]
    volume_24h: i64,
    #[serde(default)]
    open_interest: i64,
    #[serde(default)]
    rules_primary: String,
    #[serde(default)]
    close_time: String,
    #[serde(default)]
    tick_size: i64,
}

#[derive(Debug, Default, Deserialize)]
struct OrderbookResponse {
    #[serde(default)]
    yes: Vec<Vec<i64>>,
    #[serde(default)]
    no: Vec<Vec<i64>>,
}

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    series: ApiSeries,
}

#[derive(Debug, Default, Deserialize)]
struct ApiSeries {
    #[serde(default)]
    settlement_sources: Vec<ApiSettlementSource>,
    #[serde(default)]
    contract_terms_url: String,
    #[serde(default)]
    contract_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiSettlementSource {
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
}

// === Normalization helpers ===

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn cents_to_float(v: i64) -> f64 {
    v as f64 / 100.0
}

/// `[price_cents, quantity]` rows into normalized levels, cents preserved.
fn convert_levels(levels: &[Vec<i64>]) -> Vec<Level> {
    levels
        .iter()
        .filter(|row| row.len() >= 2)
        .map(|row| Level {
            price: cents_to_float(row[0]),
            quantity: row[1] as f64,
            raw_price: row[0] as f64,
            raw_amount: row[1] as f64,
        })
        .collect()
}

/// Buying YES at `1 - p` is equivalent to the resting NO bid at `p`, so the
/// opposite side's bids define this side's asks.
fn derive_asks_from_opposite(opposite_bids: &[Level]) -> Vec<Level> {
    opposite_bids
        .iter()
        .map(|level| Level {
            price: (1.0 - level.price).clamp(0.0, 1.0),
            quantity: level.quantity,
            raw_price: 100.0 - level.raw_price,
            raw_amount: level.raw_amount,
        })
        .collect()
}

/// Kalshi market titles frequently carry a double-space placeholder
/// ("Will  become ..."). Recover the entity alias from the primary rules or
/// the event title and splice it in so the question reads naturally.
fn derive_question(event_title: &str, market: &ApiMarket) -> String {
    let base = market.title.clone();

    let mut alias = extract_entity_from_rules(&market.rules_primary);
    if alias.is_empty() {
        alias = extract_entity_from_title(event_title);
    }
    if alias.is_empty() && base.contains("  ") {
        alias = extract_entity_from_title(&base);
    }
    if alias.is_empty() {
        if let Some(last) = market.ticker.rsplit('-').next() {
            alias = last.to_string();
        }
    }

    if alias.is_empty() {
        return base;
    }
    if base.to_lowercase().contains(&alias.to_lowercase()) {
        return base;
    }
    if base.contains("  ") {
        return base.replacen("  ", &format!(" {alias} "), 1);
    }
    format!("{base} ({alias})")
}

fn extract_entity_from_rules(rule: &str) -> String {
    let rule = rule.trim();
    let lower = rule.to_ascii_lowercase();
    if !lower.starts_with("if ") {
        return String::new();
    }
    let trimmed = rule[3..].trim();
    let lower_trimmed = trimmed.to_ascii_lowercase();
    const KEYWORDS: &[&str] = &[
        " becomes", " is ", " wins", " will ", " reaches", " secures", " scores", " resigns",
        " retires", " defeats", " beats", " finishes", " captures", " takes", " makes",
        " receives", " gets ",
    ];
    let mut pos: Option<usize> = None;
    for keyword in KEYWORDS {
        if let Some(idx) = lower_trimmed.find(keyword) {
            pos = Some(pos.map_or(idx, |p| p.min(idx)));
        }
    }
    let end = pos
        .or_else(|| lower_trimmed.find(','))
        .or_else(|| lower_trimmed.find(" then"))
        .unwrap_or(trimmed.len());
    trimmed[..end]
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .to_string()
}

fn extract_entity_from_title(title: &str) -> String {
    let title = title.trim();
    let lower = title.to_ascii_lowercase();
    if !lower.starts_with("will ") {
        return String::new();
    }
    let rest = &title[5..];
    let rest_lower = rest.to_ascii_lowercase();
    let end = rest_lower
        .find(" become")
        .or_else(|| rest_lower.find(" be "));
    match end {
        Some(idx) => rest[..idx]
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .to_string(),
        None => String::new(),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cents_to_float() {
        assert_eq!(cents_to_float(45), 0.45);
        assert_eq!(cents_to_float(100), 1.0);
        assert_eq!(cents_to_float(0), 0.0);
        assert_eq!(cents_to_float(1), 0.01);
    }

    #[test]
    fn test_convert_levels_skips_short_rows() {
        let rows = vec![vec![45, 120], vec![50], vec![55, 30]];
        let levels = convert_levels(&rows);
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].price, 0.45);
        assert_eq!(levels[0].quantity, 120.0);
        assert_eq!(levels[0].raw_price, 45.0);
    }

    #[test]
    fn test_derive_asks_from_opposite_bids() {
        // NO bids at 55c mean YES is buyable at 45c
        let no_bids = vec![Level {
            price: 0.55,
            quantity: 200.0,
            raw_price: 55.0,
            raw_amount: 200.0,
        }];
        let yes_asks = derive_asks_from_opposite(&no_bids);
        assert_eq!(yes_asks.len(), 1);
        assert!((yes_asks[0].price - 0.45).abs() < 1e-12);
        assert_eq!(yes_asks[0].quantity, 200.0);
        assert_eq!(yes_asks[0].raw_price, 45.0);
    }

    #[test]
    fn test_derived_asks_clamped_to_unit_interval() {
        let weird = vec![
            Level {
                price: 1.2,
                quantity: 10.0,
                raw_price: 120.0,
                raw_amount: 10.0,
            },
            Level {
                price: -0.1,
                quantity: 10.0,
                raw_price: -10.0,
                raw_amount: 10.0,
            },
        ];
        let asks = derive_asks_from_opposite(&weird);
        assert_eq!(asks[0].price, 0.0);
        assert_eq!(asks[1].price, 1.0);
    }

    #[test]
    fn test_extract_entity_from_rules() {
        assert_eq!(
            extract_entity_from_rules("If Jane Doe becomes the nominee, then..."),
            "Jane Doe"
        );
        assert_eq!(
            extract_entity_from_rules("If Real Madrid wins the final, the market resolves YES."),
            "Real Madrid"
        );
        // No keyword hit: falls back to the first comma
        assert_eq!(
            extract_entity_from_rules("If a tie occurs, the market resolves NO."),
            "a tie occurs"
        );
        assert_eq!(extract_entity_from_rules("The market resolves YES if..."), "");
    }

    #[test]
    fn test_extract_entity_from_title() {
        assert_eq!(extract_entity_from_title("Will Jane Doe become president?"), "Jane Doe");
        assert_eq!(extract_entity_from_title("Will XYZ be confirmed?"), "XYZ");
        assert_eq!(extract_entity_from_title("Who wins the race?"), "");
    }

    #[test]
    fn test_derive_question_replaces_double_space() {
        let market = ApiMarket {
            ticker: "KXNOM-26-JDOE".into(),
            title: "Will  become the nominee?".into(),
            rules_primary: "If Jane Doe becomes the nominee, then the market resolves YES.".into(),
            ..ApiMarket::default()
        };
        assert_eq!(
            derive_question("Nominee 2026", &market),
            "Will Jane Doe become the nominee?"
        );
    }

    #[test]
    fn test_derive_question_appends_ticker_alias() {
        let market = ApiMarket {
            ticker: "KXRACE-26-SMITH".into(),
            title: "Wins the race?".into(),
            ..ApiMarket::default()
        };
        assert_eq!(derive_question("Race 2026", &market), "Wins the race? (SMITH)");
    }

    #[test]
    fn test_derive_question_keeps_title_when_alias_present() {
        let market = ApiMarket {
            ticker: "KXNOM-26-JDOE".into(),
            title: "Will Jane Doe become the nominee?".into(),
            rules_primary: "If Jane Doe becomes the nominee, then...".into(),
            ..ApiMarket::default()
        };
        assert_eq!(
            derive_question("Nominee 2026", &market),
            "Will Jane Doe become the nominee?"
        );
    }
}
