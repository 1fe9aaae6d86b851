// tests/pipeline_tests.rs
// Holistic tests over the detection pipeline's pure core:
// 1. Pair identity and cache keys across payload direction
// 2. Order-book simulation scenarios end to end
// 3. Wire-format round trips with unknown fields
// 4. Replay idempotence of the durable opportunity store

use std::collections::HashMap;

use chrono::{Duration, Utc};

use arb_pipeline::arb::{self, kalshi_taker_fee, DustThresholds, SimConfig, EPSILON};
use arb_pipeline::hash::{embedding_cache_key, pair_id, verdict_cache_key};
use arb_pipeline::indexer::build_embedding_text;
use arb_pipeline::matches::{Direction, MatchPayload};
use arb_pipeline::types::{
    Event, Level, Market, MarketSnapshot, Orderbook, PriceSnapshot, Venue,
};

// ============================================================================
// FIXTURES
// ============================================================================

fn asks(levels: &[(f64, f64)]) -> Orderbook {
    Orderbook {
        bids: vec![],
        asks: levels
            .iter()
            .map(|&(price, quantity)| Level {
                price,
                quantity,
                raw_price: price,
                raw_amount: quantity,
            })
            .collect(),
    }
}

fn healthy(yes_ask: f64, no_ask: f64) -> PriceSnapshot {
    PriceSnapshot {
        yes_bid: yes_ask - 0.01,
        yes_ask,
        no_bid: no_ask - 0.01,
        no_ask,
    }
}

fn pm_snapshot(yes_asks: &[(f64, f64)], no_asks: &[(f64, f64)], price: PriceSnapshot) -> MarketSnapshot {
    let mut orderbooks = HashMap::new();
    orderbooks.insert("tok-yes".to_string(), asks(yes_asks));
    orderbooks.insert("tok-no".to_string(), asks(no_asks));
    let event = Event {
        venue: Venue::Polymarket,
        event_id: "ev-pm".into(),
        title: "Will the Fed cut rates in March?".into(),
        description: "Resolves YES if the FOMC lowers the target range at the March meeting.".into(),
        category: "Economics".into(),
        status: "open".into(),
        resolution_source: "FOMC".into(),
        resolution_details: "Based on the official FOMC statement.".into(),
        settlement_sources: vec![],
        contract_terms_url: String::new(),
        close_time: Some(Utc::now() + Duration::days(30)),
        markets: vec![],
        raw: None,
    };
    let market = Market {
        market_id: "pm-fed-march".into(),
        question: "Will the Fed cut rates in March?".into(),
        price,
        orderbooks,
        clob_token_ids: vec!["tok-yes".into(), "tok-no".into()],
        ..Market::default()
    };
    MarketSnapshot::new(Venue::Polymarket, &event, market, Utc::now())
}

fn kx_snapshot(yes_asks: &[(f64, f64)], no_asks: &[(f64, f64)], price: PriceSnapshot) -> MarketSnapshot {
    let mut orderbooks = HashMap::new();
    orderbooks.insert("yes".to_string(), asks(yes_asks));
    orderbooks.insert("no".to_string(), asks(no_asks));
    let event = Event {
        venue: Venue::Kalshi,
        event_id: "KXFEDDECISION-26MAR".into(),
        title: "Fed decision in March".into(),
        description: "Will the Federal Reserve cut rates?".into(),
        category: "Economics".into(),
        status: "open".into(),
        resolution_source: "Federal Reserve".into(),
        resolution_details: "If the target range is lowered, the market resolves Yes.".into(),
        settlement_sources: vec![],
        contract_terms_url: String::new(),
        close_time: Some(Utc::now() + Duration::days(30)),
        markets: vec![],
        raw: None,
    };
    let market = Market {
        market_id: "KXFEDDECISION-26MAR-CUT".into(),
        question: "Will the Fed cut rates in March?".into(),
        price,
        orderbooks,
        ..Market::default()
    };
    MarketSnapshot::new(Venue::Kalshi, &event, market, Utc::now())
}

fn scenario_a_payload() -> MatchPayload {
    let pm = pm_snapshot(&[(0.40, 100.0)], &[(0.60, 100.0)], healthy(0.40, 0.60));
    let kx = kx_snapshot(&[(0.50, 100.0)], &[(0.45, 100.0)], healthy(0.50, 0.45));
    MatchPayload::new(pm, kx, 0.99, 0.01)
}

// ============================================================================
// IDENTITY INVARIANTS
// ============================================================================

mod identity_tests {
    use super::*;

    /// Pair identity survives swapping source and target.
    #[test]
    fn test_pair_id_direction_independent() {
        let pm = pm_snapshot(&[(0.40, 10.0)], &[(0.60, 10.0)], healthy(0.40, 0.60));
        let kx = kx_snapshot(&[(0.50, 10.0)], &[(0.45, 10.0)], healthy(0.50, 0.45));

        let forward = MatchPayload::new(pm.clone(), kx.clone(), 0.97, 0.03);
        let reverse = MatchPayload::new(kx, pm, 0.97, 0.03);
        assert_eq!(forward.pair_id, reverse.pair_id);
        assert_eq!(forward.pair_id, pair_id(&forward.source, &forward.target));
    }

    /// The verdict cache key is symmetric and text-sensitive.
    #[test]
    fn test_verdict_key_symmetric_and_content_addressed() {
        let pm = pm_snapshot(&[], &[], PriceSnapshot::default());
        let kx = kx_snapshot(&[], &[], PriceSnapshot::default());
        assert_eq!(verdict_cache_key(&pm, &kx), verdict_cache_key(&kx, &pm));

        let mut edited = kx.clone();
        edited.event.resolution_details = "Amended: resolves via a different source.".into();
        assert_ne!(
            verdict_cache_key(&pm, &kx),
            verdict_cache_key(&pm, &edited),
            "editing resolution text must roll the key"
        );
        // but the pair id stays put
        assert_eq!(pair_id(&pm, &kx), pair_id(&pm, &edited));
    }

    /// The embedding cache key tracks the embedding text exactly.
    #[test]
    fn test_embedding_key_tracks_text() {
        let kx = kx_snapshot(&[], &[], PriceSnapshot::default());
        let text = build_embedding_text(&kx);
        let key = embedding_cache_key(&kx, &text);
        assert!(key.starts_with("kalshi:KXFEDDECISION-26MAR-CUT:"));

        let mut edited = kx.clone();
        edited.market.subtitle = "New subtitle.".into();
        let edited_text = build_embedding_text(&edited);
        assert_ne!(key, embedding_cache_key(&edited, &edited_text));
    }
}

// ============================================================================
// SIMULATOR SCENARIOS
// ============================================================================

mod simulator_tests {
    use super::*;

    /// Scenario A: buy YES on Polymarket (0.40) and NO on Kalshi (0.45).
    #[test]
    fn test_profitable_symmetric_pair() {
        let result = arb::evaluate(&scenario_a_payload(), &SimConfig::default());
        assert!(!result.untradable, "reason: {}", result.reason);

        let best = result.best.expect("opportunity");
        assert_eq!(best.direction, Direction::BuyYesPmBuyNoKalshi);
        assert!(best.profit_usd > 0.0);
        assert!(best.total_cost_usd <= best.budget_usd + EPSILON);
        assert!((best.profit_usd - (best.quantity - best.total_cost_usd)).abs() < EPSILON);

        // Both legs carry the same matched quantity
        assert_eq!(best.legs.len(), 2);
        assert!((best.legs[0].quantity - best.legs[1].quantity).abs() < EPSILON);
        assert_eq!(best.legs[0].venue, "polymarket");
        assert_eq!(best.legs[1].venue, "kalshi");
    }

    /// Scenario B: dust quotes on both Kalshi sides mark the venue untradable.
    #[test]
    fn test_untradable_dust() {
        let pm = pm_snapshot(&[(0.40, 100.0)], &[(0.60, 100.0)], healthy(0.40, 0.60));
        let kx = kx_snapshot(
            &[(0.03, 100.0)],
            &[(0.03, 100.0)],
            PriceSnapshot {
                yes_bid: 0.01,
                yes_ask: 0.03,
                no_bid: 0.01,
                no_ask: 0.03,
            },
        );
        let result = arb::evaluate(&MatchPayload::new(pm, kx, 0.99, 0.01), &SimConfig::default());
        assert!(result.untradable);
        assert_eq!(result.reason, "kalshi both sides effectively untradable");
    }

    /// Scenario F: the Kalshi taker fee lowers profit by exactly the rounded
    /// amount and is reported to the cent.
    #[test]
    fn test_fee_reported_to_the_cent() {
        let cfg = SimConfig {
            budget_usd: 1000.0,
            ..SimConfig::default()
        };
        let result = arb::evaluate(&scenario_a_payload(), &cfg);
        let best = result.best.unwrap();

        let expected_fee = kalshi_taker_fee(best.quantity, 0.45);
        assert!((best.kalshi_fees_usd - expected_fee).abs() < EPSILON);
        assert_eq!(best.polymarket_fees_usd, 0.0, "venue P charges no taker fee");

        let gross = best.quantity - (best.quantity * 0.40 + best.quantity * 0.45);
        assert!((gross - best.profit_usd - expected_fee).abs() < 1e-6);
    }

    /// The dust constants are policy knobs; loosening them flips the verdict.
    #[test]
    fn test_dust_thresholds_are_configurable() {
        let pm = pm_snapshot(&[(0.40, 100.0)], &[(0.60, 100.0)], healthy(0.40, 0.60));
        let wide_spread = PriceSnapshot {
            yes_bid: 0.30,
            yes_ask: 0.40, // 10c spread, above the default 5c cap
            no_bid: 0.55,
            no_ask: 0.65,
        };
        let kx = kx_snapshot(&[(0.40, 100.0)], &[(0.65, 100.0)], wide_spread);
        let payload = MatchPayload::new(pm, kx, 0.99, 0.01);

        let strict = arb::evaluate(&payload, &SimConfig::default());
        assert!(strict.untradable);

        let loose = SimConfig {
            dust: DustThresholds {
                max_spread: 0.15,
                ..DustThresholds::default()
            },
            ..SimConfig::default()
        };
        let relaxed = arb::evaluate(&payload, &loose);
        assert!(!relaxed.untradable, "wider spread cap must admit the pair");
    }

    /// Replaying the same payload yields bit-identical evaluations.
    #[test]
    fn test_evaluation_is_deterministic() {
        let payload = scenario_a_payload();
        let cfg = SimConfig::default();
        let first = arb::evaluate(&payload, &cfg);
        let second = arb::evaluate(&payload, &cfg);
        assert_eq!(
            serde_json::to_string(&first.best).unwrap(),
            serde_json::to_string(&second.best).unwrap()
        );
    }
}

// ============================================================================
// WIRE FORMAT
// ============================================================================

mod wire_tests {
    use super::*;

    /// Decode -> encode keeps every field, including ones this build does not
    /// know about.
    #[test]
    fn test_match_payload_passthrough() {
        let payload = scenario_a_payload();
        let mut value = serde_json::to_value(&payload).unwrap();
        let object = value.as_object_mut().unwrap();
        object.insert("deployment_epoch".into(), serde_json::json!(7));
        object.insert(
            "routing".into(),
            serde_json::json!({"cluster": "us-east", "shard": 3}),
        );

        let decoded: MatchPayload = serde_json::from_value(value.clone()).unwrap();
        let reencoded = serde_json::to_value(&decoded).unwrap();

        assert_eq!(reencoded["deployment_epoch"], serde_json::json!(7));
        assert_eq!(reencoded["routing"]["shard"], serde_json::json!(3));
        assert_eq!(reencoded["pair_id"], value["pair_id"]);
        assert_eq!(reencoded["source"]["venue"], "polymarket");
    }

    /// A payload that went through the full validation pass still round-trips.
    #[test]
    fn test_enriched_payload_roundtrip() {
        let mut payload = scenario_a_payload();
        let result = arb::evaluate(&payload, &SimConfig::default());
        payload.arbitrage = result.best.clone();
        payload.resolution_verdict = Some(arb_pipeline::matches::ResolutionVerdict::new(
            true,
            "identical resolution criteria",
        ));
        payload.final_opportunity = result.best;

        let json = serde_json::to_string(&payload).unwrap();
        let back: MatchPayload = serde_json::from_str(&json).unwrap();
        assert!(back.resolution_verdict.unwrap().valid_resolution);
        assert_eq!(
            back.arbitrage.unwrap().direction,
            Direction::BuyYesPmBuyNoKalshi
        );
    }
}

// ============================================================================
// FRESHNESS WINDOW
// ============================================================================

mod freshness_tests {
    use super::*;

    /// Scenario E: a candidate captured outside the freshness window is
    /// rejected by the matcher's re-check even at high similarity.
    #[test]
    fn test_stale_candidate_rejected() {
        let window = Duration::seconds(600);
        let cutoff = Utc::now() - window;

        let mut stale = kx_snapshot(&[(0.50, 10.0)], &[(0.45, 10.0)], healthy(0.50, 0.45));
        stale.captured_at = Utc::now() - Duration::seconds(700);
        assert!(stale.captured_at < cutoff, "candidate is stale");

        let mut fresh = stale.clone();
        fresh.captured_at = Utc::now() - Duration::seconds(100);
        assert!(fresh.captured_at >= cutoff, "candidate is fresh");
    }
}

// ============================================================================
// STORE REPLAY
// ============================================================================

mod replay_tests {
    use super::*;
    use arb_pipeline::storage::OpportunityRow;

    /// Re-running the pipeline over the same replayed snapshots produces the
    /// same pair ids and the same row keys, so the unique index absorbs them.
    #[test]
    fn test_replay_produces_identical_row_keys() {
        let payload = scenario_a_payload();
        let result = arb::evaluate(&payload, &SimConfig::default());

        let first = OpportunityRow::build(&payload, &result);
        let second = OpportunityRow::build(&payload, &result);

        assert_eq!(first.pair_id, second.pair_id);
        assert_eq!(first.matched_at, second.matched_at);
        assert_eq!(first.direction, second.direction);
        assert_eq!(first.raw_payload_json, second.raw_payload_json);
    }
}
