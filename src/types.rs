//! Core type definitions for the cross-venue arbitrage pipeline.
//!
//! This module provides the normalized market model shared by the collectors,
//! the embedding/indexing workers, and the arbitrage engine: venue-scoped
//! events, markets with depth-N order books, and the immutable snapshots
//! that travel on the message log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// === Venue ===

/// A prediction-market platform with an independent order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Polymarket,
    Kalshi,
}

impl Venue {
    /// The other venue of the pair.
    pub fn opposite(self) -> Venue {
        match self {
            Venue::Polymarket => Venue::Kalshi,
            Venue::Kalshi => Venue::Polymarket,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Venue::Polymarket => "polymarket",
            Venue::Kalshi => "kalshi",
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// === Events and markets ===

/// A named settlement source (e.g. "AP", "https://apnews.com").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionSource {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

/// A normalized event that may contain multiple markets/outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub venue: Venue,
    pub event_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub resolution_source: String,
    #[serde(default)]
    pub resolution_details: String,
    #[serde(default)]
    pub settlement_sources: Vec<ResolutionSource>,
    #[serde(default)]
    pub contract_terms_url: String,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub markets: Vec<Market>,
    /// Venue-native payload kept for audit; never interpreted downstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

/// Top-of-book bid/ask for both outcomes, as decimal probabilities in [0,1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    #[serde(default)]
    pub yes_bid: f64,
    #[serde(default)]
    pub yes_ask: f64,
    #[serde(default)]
    pub no_bid: f64,
    #[serde(default)]
    pub no_ask: f64,
}

/// A single price/quantity pair on one side of a book.
///
/// `raw_price`/`raw_amount` preserve the venue-native values (integer cents
/// for Kalshi) so normalization stays auditable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub raw_price: f64,
    #[serde(default)]
    pub raw_amount: f64,
}

/// Depth-N order book for one outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Orderbook {
    #[serde(default)]
    pub bids: Vec<Level>,
    #[serde(default)]
    pub asks: Vec<Level>,
}

/// A normalized market belonging to an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Market {
    #[serde(default)]
    pub market_id: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub tick_size: f64,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub volume_24h: f64,
    #[serde(default)]
    pub open_interest: f64,
    #[serde(default)]
    pub price: PriceSnapshot,
    /// Keyed by outcome/token label (Polymarket: CLOB token id; Kalshi: "yes"/"no").
    #[serde(default)]
    pub orderbooks: HashMap<String, Orderbook>,
    /// Polymarket-specific: position 0 = YES token, position 1 = NO token.
    #[serde(default)]
    pub clob_token_ids: Vec<String>,
    #[serde(default)]
    pub reference_url: String,
}

// === Snapshots ===

/// An immutable moment-in-time view of one market and its event context.
///
/// Snapshots are the unit of transport on the log; new polling epochs create
/// new snapshots rather than mutating existing ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub venue: Venue,
    pub event: Event,
    pub market: Market,
    pub captured_at: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Builds a snapshot, stripping the event's market list so each message
    /// carries exactly one market.
    pub fn new(venue: Venue, event: &Event, market: Market, captured_at: DateTime<Utc>) -> Self {
        let mut event = event.clone();
        event.markets = Vec::new();
        Self {
            venue,
            event,
            market,
            captured_at,
        }
    }

    /// Close time of the market, falling back to the event's.
    pub fn close_time(&self) -> Option<DateTime<Utc>> {
        self.market.close_time.or(self.event.close_time)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_event_with_markets() -> Event {
        Event {
            venue: Venue::Polymarket,
            event_id: "ev-1".into(),
            title: "Fed decision".into(),
            description: "Will the Fed cut rates?".into(),
            category: "Economics".into(),
            status: "open".into(),
            resolution_source: "FOMC".into(),
            resolution_details: "Settled on the FOMC statement.".into(),
            settlement_sources: vec![ResolutionSource {
                name: "FOMC".into(),
                url: "https://www.federalreserve.gov".into(),
            }],
            contract_terms_url: String::new(),
            close_time: Some(Utc.with_ymd_and_hms(2026, 3, 18, 18, 0, 0).unwrap()),
            markets: vec![
                Market {
                    market_id: "mkt-1".into(),
                    ..Market::default()
                },
                Market {
                    market_id: "mkt-2".into(),
                    ..Market::default()
                },
            ],
            raw: None,
        }
    }

    #[test]
    fn test_snapshot_strips_event_markets() {
        let event = make_event_with_markets();
        let market = event.markets[0].clone();
        let snap = MarketSnapshot::new(Venue::Polymarket, &event, market, Utc::now());

        assert!(snap.event.markets.is_empty(), "snapshot event must not nest markets");
        assert_eq!(snap.market.market_id, "mkt-1");
        // Original event untouched
        assert_eq!(event.markets.len(), 2);
    }

    #[test]
    fn test_snapshot_close_time_falls_back_to_event() {
        let event = make_event_with_markets();
        let market = event.markets[0].clone();
        let snap = MarketSnapshot::new(Venue::Polymarket, &event, market, Utc::now());

        assert_eq!(snap.close_time(), event.close_time, "market close_time is None, use event's");
    }

    #[test]
    fn test_venue_opposite() {
        assert_eq!(Venue::Polymarket.opposite(), Venue::Kalshi);
        assert_eq!(Venue::Kalshi.opposite(), Venue::Polymarket);
    }

    #[test]
    fn test_venue_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Venue::Polymarket).unwrap(), "\"polymarket\"");
        assert_eq!(serde_json::to_string(&Venue::Kalshi).unwrap(), "\"kalshi\"");
        let v: Venue = serde_json::from_str("\"kalshi\"").unwrap();
        assert_eq!(v, Venue::Kalshi);
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let event = make_event_with_markets();
        let market = event.markets[1].clone();
        let snap = MarketSnapshot::new(Venue::Polymarket, &event, market, Utc::now());

        let json = serde_json::to_string(&snap).unwrap();
        let back: MarketSnapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(back.venue, snap.venue);
        assert_eq!(back.market.market_id, snap.market.market_id);
        assert_eq!(back.event.event_id, snap.event.event_id);
        assert_eq!(back.captured_at, snap.captured_at);
    }
}
