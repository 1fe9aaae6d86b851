//! Match payloads and arbitrage opportunity records.
//!
//! `MatchPayload` is the envelope published by the matcher and consumed by the
//! validation/arbitrage stage. Unknown JSON fields survive a decode/encode
//! round trip so older and newer workers can share a topic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::pair_id;
use crate::types::MarketSnapshot;

/// Which side of YES/NO is bought on each venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "BUY_YES_PM_BUY_NO_KALSHI")]
    BuyYesPmBuyNoKalshi,
    #[serde(rename = "BUY_NO_PM_BUY_YES_KALSHI")]
    BuyNoPmBuyYesKalshi,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::BuyYesPmBuyNoKalshi => f.write_str("BUY_YES_PM_BUY_NO_KALSHI"),
            Direction::BuyNoPmBuyYesKalshi => f.write_str("BUY_NO_PM_BUY_YES_KALSHI"),
        }
    }
}

/// One executed side of an opportunity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub venue: String,
    pub side: String,
    pub outcome: String,
    pub avg_price: f64,
    pub quantity: f64,
    pub cost_usd: f64,
}

/// An executable arbitrage opportunity under a USD budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub direction: Direction,
    pub quantity: f64,
    pub profit_usd: f64,
    pub total_cost_usd: f64,
    pub budget_usd: f64,
    pub kalshi_fees_usd: f64,
    pub polymarket_fees_usd: f64,
    #[serde(default)]
    pub legs: Vec<Leg>,
}

/// The validator's judgment that a pair resolves on identical semantics.
///
/// Field names follow the LLM's required output shape verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionVerdict {
    #[serde(rename = "ValidResolution")]
    pub valid_resolution: bool,
    #[serde(rename = "ResolutionReason")]
    pub resolution_reason: String,
}

impl ResolutionVerdict {
    pub fn new(valid: bool, reason: impl Into<String>) -> Self {
        Self {
            valid_resolution: valid,
            resolution_reason: reason.into(),
        }
    }
}

/// Live snapshots fetched right before the final arbitrage pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FreshSnapshots {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polymarket: Option<MarketSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kalshi: Option<MarketSnapshot>,
}

const PAYLOAD_VERSION: u32 = 1;

/// The envelope published to the matches topic, keyed by `pair_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchPayload {
    pub version: u32,
    pub pair_id: String,
    pub similarity: f64,
    pub distance: f64,
    pub matched_at: DateTime<Utc>,
    pub source: MarketSnapshot,
    pub target: MarketSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arbitrage: Option<Opportunity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_verdict: Option<ResolutionVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fresh: Option<FreshSnapshots>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_opportunity: Option<Opportunity>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cached_verdict: bool,
    /// Fields this build does not know about, preserved through re-marshaling.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MatchPayload {
    /// Builds a match payload with canonical pair ID ordering.
    pub fn new(
        source: MarketSnapshot,
        target: MarketSnapshot,
        similarity: f64,
        distance: f64,
    ) -> Self {
        let id = pair_id(&source, &target);
        Self {
            version: PAYLOAD_VERSION,
            pair_id: id,
            similarity,
            distance,
            matched_at: Utc::now(),
            source,
            target,
            arbitrage: None,
            resolution_verdict: None,
            fresh: None,
            final_opportunity: None,
            cached_verdict: false,
            extra: serde_json::Map::new(),
        }
    }

    /// Snapshot for the given venue, if present on either side.
    pub fn snapshot_for(&self, venue: crate::types::Venue) -> Option<&MarketSnapshot> {
        if self.source.venue == venue {
            Some(&self.source)
        } else if self.target.venue == venue {
            Some(&self.target)
        } else {
            None
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, Market, Venue};

    fn snap(venue: Venue, market_id: &str) -> MarketSnapshot {
        let event = Event {
            venue,
            event_id: format!("ev-{market_id}"),
            title: "Test".into(),
            description: String::new(),
            category: String::new(),
            status: String::new(),
            resolution_source: String::new(),
            resolution_details: String::new(),
            settlement_sources: vec![],
            contract_terms_url: String::new(),
            close_time: None,
            markets: vec![],
            raw: None,
        };
        let market = Market {
            market_id: market_id.into(),
            ..Market::default()
        };
        MarketSnapshot::new(venue, &event, market, Utc::now())
    }

    #[test]
    fn test_payload_pair_id_symmetric_under_swap() {
        let pm = snap(Venue::Polymarket, "mkt-1");
        let kx = snap(Venue::Kalshi, "KXTEST-1");
        let forward = MatchPayload::new(pm.clone(), kx.clone(), 0.97, 0.03);
        let swapped = MatchPayload::new(kx, pm, 0.97, 0.03);
        assert_eq!(forward.pair_id, swapped.pair_id);
    }

    #[test]
    fn test_payload_json_roundtrip() {
        let payload = MatchPayload::new(
            snap(Venue::Polymarket, "mkt-1"),
            snap(Venue::Kalshi, "KXTEST-1"),
            0.97,
            0.03,
        );
        let json = serde_json::to_string(&payload).unwrap();
        let back: MatchPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, 1);
        assert_eq!(back.pair_id, payload.pair_id);
        assert_eq!(back.similarity, payload.similarity);
        assert!(back.arbitrage.is_none());
        assert!(!back.cached_verdict);
    }

    #[test]
    fn test_payload_preserves_unknown_fields() {
        let payload = MatchPayload::new(
            snap(Venue::Polymarket, "mkt-1"),
            snap(Venue::Kalshi, "KXTEST-1"),
            0.99,
            0.01,
        );
        let mut value = serde_json::to_value(&payload).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("future_field".into(), serde_json::json!({"nested": [1, 2, 3]}));

        let decoded: MatchPayload = serde_json::from_value(value).unwrap();
        let reencoded = serde_json::to_value(&decoded).unwrap();
        assert_eq!(
            reencoded["future_field"],
            serde_json::json!({"nested": [1, 2, 3]}),
            "unknown fields must survive decode/encode"
        );
    }

    #[test]
    fn test_direction_wire_names() {
        assert_eq!(
            serde_json::to_string(&Direction::BuyYesPmBuyNoKalshi).unwrap(),
            "\"BUY_YES_PM_BUY_NO_KALSHI\""
        );
        assert_eq!(
            serde_json::to_string(&Direction::BuyNoPmBuyYesKalshi).unwrap(),
            "\"BUY_NO_PM_BUY_YES_KALSHI\""
        );
    }

    #[test]
    fn test_verdict_wire_names() {
        let verdict = ResolutionVerdict::new(true, "same settlement source");
        let json = serde_json::to_string(&verdict).unwrap();
        assert!(json.contains("\"ValidResolution\":true"));
        assert!(json.contains("\"ResolutionReason\""));
    }

    #[test]
    fn test_snapshot_for_venue() {
        let payload = MatchPayload::new(
            snap(Venue::Polymarket, "mkt-1"),
            snap(Venue::Kalshi, "KXTEST-1"),
            0.99,
            0.01,
        );
        assert_eq!(
            payload.snapshot_for(Venue::Kalshi).unwrap().market.market_id,
            "KXTEST-1"
        );
        assert_eq!(
            payload.snapshot_for(Venue::Polymarket).unwrap().market.market_id,
            "mkt-1"
        );
    }
}
