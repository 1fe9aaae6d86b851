//! Order-book walking arbitrage simulator.
//!
//! Given a matched pair of snapshots, the simulator evaluates both
//! complementary directions (buy YES on one venue, NO on the other) against
//! the captured ask ladders under a USD budget, charging the Kalshi taker fee
//! per filled slice. A pair of 1-contract positions pays out exactly $1
//! regardless of outcome, so gross revenue equals total matched quantity.

use std::env;

use crate::matches::{Direction, Leg, MatchPayload, Opportunity};
use crate::types::{Level, Market, MarketSnapshot, Orderbook, Venue};

pub const EPSILON: f64 = 1e-9;

/// Liquidity/dust policy thresholds. These encode a trading policy, not a
/// fundamental truth; each is overridable from the environment.
#[derive(Debug, Clone, Copy)]
pub struct DustThresholds {
    /// Top-of-book spread above this means basically not tradable.
    pub max_spread: f64,
    /// Penny bid level.
    pub dust_bid: f64,
    /// Ask level that, combined with a penny bid, marks dust.
    pub dust_ask: f64,
    /// Low-ask region that often indicates longshot dust.
    pub low_ask: f64,
    /// Spread considered wide at penny prices.
    pub low_spread: f64,
}

impl Default for DustThresholds {
    fn default() -> Self {
        Self {
            max_spread: 0.05,
            dust_bid: 0.01,
            dust_ask: 0.03,
            low_ask: 0.05,
            low_spread: 0.02,
        }
    }
}

impl DustThresholds {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_spread: env_f64("ARB_MAX_SPREAD", defaults.max_spread),
            dust_bid: env_f64("ARB_DUST_BID", defaults.dust_bid),
            dust_ask: env_f64("ARB_DUST_ASK", defaults.dust_ask),
            low_ask: env_f64("ARB_LOW_ASK", defaults.low_ask),
            low_spread: env_f64("ARB_LOW_SPREAD", defaults.low_spread),
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Simulator configuration for one evaluation pass.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    pub budget_usd: f64,
    /// Test-only knob: emit a synthetic opportunity to exercise downstream stages.
    pub force_verdict: bool,
    pub dust: DustThresholds,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            budget_usd: 100.0,
            force_verdict: false,
            dust: DustThresholds::default(),
        }
    }
}

/// Outcome of evaluating both directions for a pair.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub opportunities: Vec<Opportunity>,
    pub best: Option<Opportunity>,
    pub untradable: bool,
    pub reason: String,
}

impl Evaluation {
    fn untradable(reason: impl Into<String>) -> Self {
        Self {
            untradable: true,
            reason: reason.into(),
            ..Self::default()
        }
    }
}

/// Computes both arbitrage directions for a matched pair and returns the one
/// with maximal profit.
pub fn evaluate(payload: &MatchPayload, cfg: &SimConfig) -> Evaluation {
    let budget = if cfg.budget_usd <= 0.0 {
        100.0
    } else {
        cfg.budget_usd
    };

    let Some((pm, kx)) = extract_snapshots(payload) else {
        return Evaluation::untradable("missing snapshots");
    };

    if cfg.force_verdict {
        let forced = Opportunity {
            direction: Direction::BuyYesPmBuyNoKalshi,
            quantity: 1.0,
            profit_usd: 0.01,
            total_cost_usd: 0.99,
            budget_usd: budget,
            kalshi_fees_usd: 0.0,
            polymarket_fees_usd: 0.0,
            legs: vec![],
        };
        return Evaluation {
            opportunities: vec![forced.clone()],
            best: Some(forced),
            untradable: false,
            reason: String::new(),
        };
    }

    if let Some(reason) = untradable_reason(pm, kx, &cfg.dust) {
        return Evaluation::untradable(reason);
    }

    let mut result = Evaluation::default();
    for dir in [Direction::BuyYesPmBuyNoKalshi, Direction::BuyNoPmBuyYesKalshi] {
        if let Some(op) = simulate_direction(budget, dir, pm, kx) {
            let better = result
                .best
                .as_ref()
                .map(|b| op.profit_usd > b.profit_usd)
                .unwrap_or(true);
            if better {
                result.best = Some(op.clone());
            }
            result.opportunities.push(op);
        }
    }

    if result.best.is_none() {
        return Evaluation::untradable("no profitable direction");
    }
    result
}

/// One outcome side is bad when there is no real executable quote, the spread
/// is absurd, or the quotes look like longshot dust.
fn side_bad(bid: f64, ask: f64, dust: &DustThresholds) -> bool {
    if ask <= EPSILON || bid < 0.0 || ask < 0.0 {
        return true;
    }
    // bid basically missing usually signals an empty book
    if bid <= EPSILON {
        return true;
    }
    let spread = ask - bid;
    if spread < 0.0 {
        // crossed/locked book: data is suspect
        return true;
    }
    if spread > dust.max_spread {
        return true;
    }
    if bid <= dust.dust_bid && ask >= dust.dust_ask {
        return true;
    }
    if ask <= dust.low_ask && spread >= dust.low_spread {
        return true;
    }
    false
}

fn venue_bad(snap: &MarketSnapshot, dust: &DustThresholds) -> bool {
    let price = &snap.market.price;
    side_bad(price.yes_bid, price.yes_ask, dust) && side_bad(price.no_bid, price.no_ask, dust)
}

/// Returns a reason when either venue fails the liquidity/dust pre-check.
/// A venue is untradable only when BOTH outcome sides are bad.
fn untradable_reason(
    pm: &MarketSnapshot,
    kx: &MarketSnapshot,
    dust: &DustThresholds,
) -> Option<String> {
    if pm.market.price.yes_ask <= EPSILON && pm.market.price.no_ask <= EPSILON {
        return Some("polymarket zero liquidity (asks)".into());
    }
    if kx.market.price.yes_ask <= EPSILON && kx.market.price.no_ask <= EPSILON {
        return Some("kalshi zero liquidity (asks)".into());
    }
    if venue_bad(pm, dust) {
        return Some("polymarket both sides effectively untradable".into());
    }
    if venue_bad(kx, dust) {
        return Some("kalshi both sides effectively untradable".into());
    }
    None
}

/// Resolves which payload side is which venue. Pairs where both snapshots sit
/// on the same venue are not tradable cross-venue.
fn extract_snapshots(payload: &MatchPayload) -> Option<(&MarketSnapshot, &MarketSnapshot)> {
    let pm = payload.snapshot_for(Venue::Polymarket)?;
    let kx = payload.snapshot_for(Venue::Kalshi)?;
    if pm.venue != Venue::Polymarket || kx.venue != Venue::Kalshi {
        return None;
    }
    Some((pm, kx))
}

fn pm_orderbook(market: &Market, yes: bool) -> Orderbook {
    let idx = if yes { 0 } else { 1 };
    market
        .clob_token_ids
        .get(idx)
        .filter(|token| !token.is_empty())
        .and_then(|token| market.orderbooks.get(token))
        .cloned()
        .unwrap_or_default()
}

fn kx_orderbook(market: &Market, outcome: &str) -> Orderbook {
    market.orderbooks.get(outcome).cloned().unwrap_or_default()
}

fn simulate_direction(
    budget: f64,
    dir: Direction,
    pm_snap: &MarketSnapshot,
    kx_snap: &MarketSnapshot,
) -> Option<Opportunity> {
    let (pm_book, kx_book, pm_outcome, kx_outcome) = match dir {
        Direction::BuyYesPmBuyNoKalshi => (
            pm_orderbook(&pm_snap.market, true),
            kx_orderbook(&kx_snap.market, "no"),
            "yes",
            "no",
        ),
        Direction::BuyNoPmBuyYesKalshi => (
            pm_orderbook(&pm_snap.market, false),
            kx_orderbook(&kx_snap.market, "yes"),
            "no",
            "yes",
        ),
    };

    if pm_book.asks.is_empty() || kx_book.asks.is_empty() {
        return None;
    }

    let mut pm_iter = AskIterator::new(&pm_book.asks);
    let mut kx_iter = AskIterator::new(&kx_book.asks);

    let mut total_qty = 0.0;
    let mut poly_cost = 0.0;
    let mut kalshi_cost = 0.0;
    let mut kalshi_fees = 0.0;

    loop {
        let pm_qty = pm_iter.peek_qty();
        let kx_qty = kx_iter.peek_qty();
        if pm_qty <= EPSILON || kx_qty <= EPSILON {
            break;
        }
        let price_pm = pm_iter.peek_price();
        let price_kx = kx_iter.peek_price();

        let budget_remaining = budget - (poly_cost + kalshi_cost + kalshi_fees);
        if budget_remaining <= EPSILON {
            break;
        }
        let fee_rate = 0.07 * price_kx * (1.0 - price_kx);
        let unit_cost = price_pm + price_kx;
        if unit_cost <= EPSILON {
            break;
        }

        let mut delta = pm_qty
            .min(kx_qty)
            .min(budget_remaining / (unit_cost + fee_rate));
        if delta <= EPSILON {
            break;
        }

        let mut fee = kalshi_taker_fee(delta, price_kx);
        // Fee rounding (always up to the next cent) can push the slice past
        // the budget; shrink the slice so the total never exceeds it.
        if delta * unit_cost + fee > budget_remaining + EPSILON {
            delta = (budget_remaining - fee) / unit_cost;
            if delta <= EPSILON {
                break;
            }
            fee = kalshi_taker_fee(delta, price_kx);
        }

        let Some(cost_pm) = pm_iter.take(delta) else {
            break;
        };
        let Some(cost_kx) = kx_iter.take(delta) else {
            break;
        };

        poly_cost += cost_pm;
        kalshi_cost += cost_kx;
        kalshi_fees += fee;
        total_qty += delta;

        if budget - (poly_cost + kalshi_cost + kalshi_fees) <= EPSILON {
            break;
        }
    }

    if total_qty <= EPSILON {
        return None;
    }

    let total_cost = poly_cost + kalshi_cost + kalshi_fees;
    let pm_leg = Leg {
        venue: Venue::Polymarket.as_str().into(),
        side: "buy".into(),
        outcome: pm_outcome.into(),
        avg_price: poly_cost / total_qty,
        quantity: total_qty,
        cost_usd: poly_cost,
    };
    let kx_leg = Leg {
        venue: Venue::Kalshi.as_str().into(),
        side: "buy".into(),
        outcome: kx_outcome.into(),
        avg_price: kalshi_cost / total_qty,
        quantity: total_qty,
        cost_usd: kalshi_cost,
    };

    Some(Opportunity {
        direction: dir,
        quantity: total_qty,
        profit_usd: total_qty - total_cost,
        total_cost_usd: total_cost,
        budget_usd: budget,
        kalshi_fees_usd: kalshi_fees,
        polymarket_fees_usd: 0.0,
        legs: vec![pm_leg, kx_leg],
    })
}

/// Kalshi taker fee for `quantity` contracts at `price`, rounded UP to the
/// next cent: ceil(7 * q * p * (1 - p)) / 100.
pub fn kalshi_taker_fee(quantity: f64, price: f64) -> f64 {
    ((7.0 * quantity * price * (1.0 - price)).ceil() / 100.0).max(0.0)
}

/// Walks an ask ladder cheapest-first over a private copy of the levels, so
/// in-place decrements never leak across direction evaluations.
struct AskIterator {
    levels: Vec<Level>,
    idx: usize,
}

impl AskIterator {
    fn new(levels: &[Level]) -> Self {
        let mut copied = levels.to_vec();
        copied.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        Self {
            levels: copied,
            idx: 0,
        }
    }

    fn peek_qty(&mut self) -> f64 {
        while self.idx < self.levels.len() {
            let qty = self.levels[self.idx].quantity;
            if qty > EPSILON {
                return qty;
            }
            self.idx += 1;
        }
        0.0
    }

    fn peek_price(&mut self) -> f64 {
        while self.idx < self.levels.len() {
            if self.levels[self.idx].quantity > EPSILON {
                return self.levels[self.idx].price;
            }
            self.idx += 1;
        }
        0.0
    }

    fn take(&mut self, qty: f64) -> Option<f64> {
        while self.idx < self.levels.len() {
            let level = &mut self.levels[self.idx];
            if level.quantity <= EPSILON {
                self.idx += 1;
                continue;
            }
            if level.quantity + EPSILON < qty {
                return None;
            }
            level.quantity -= qty;
            let cost = qty * level.price;
            if level.quantity <= EPSILON {
                self.idx += 1;
            }
            return Some(cost);
        }
        None
    }
}

// =============================================================================
// TESTS
// =============================================================================
