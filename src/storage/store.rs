//! Non-blocking SQLite writer using a dedicated thread and mpsc channel.
//!
//! The async stages never touch the connection; they send prepared records
//! over the channel and the writer thread batches them into transactions.
//! Replayed opportunity rows are absorbed by the (pair_id, matched_at)
//! unique index.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{error, info, warn};

use super::schema::create_tables;
use crate::arb::Evaluation;
use crate::hash::hash_strings;
use crate::matches::MatchPayload;
use crate::types::{Event, Market, Orderbook, Venue};

/// Messages sent to the storage writer thread.
pub enum StorageMessage {
    /// Upsert every market of the fetched events (one collection cycle).
    Markets(Venue, Vec<Event>),
    /// Record one evaluated opportunity.
    Opportunity(Box<OpportunityRow>),
    /// Graceful shutdown.
    Shutdown,
}

/// Fully serialized opportunity record, prepared on the async side so the
/// writer thread does no JSON work.
pub struct OpportunityRow {
    pub pair_id: String,
    pub source_venue: String,
    pub source_market_id: String,
    pub source_question: String,
    pub source_yes_price: f64,
    pub source_no_price: f64,
    pub target_venue: String,
    pub target_market_id: String,
    pub target_question: String,
    pub target_yes_price: f64,
    pub target_no_price: f64,
    pub similarity: f64,
    pub distance: f64,
    pub matched_at: String,
    pub direction: String,
    pub qty_contracts: f64,
    pub total_cost_usd: f64,
    pub profit_usd: f64,
    pub budget_usd: f64,
    pub kalshi_fees_usd: f64,
    pub polymarket_fees_usd: f64,
    pub legs_json: String,
    pub raw_payload_json: String,
}

impl OpportunityRow {
    /// Flattens a payload plus its evaluation into a row. The best
    /// opportunity's numbers are recorded; an unprofitable or untradable
    /// evaluation records zeros with the full payload kept for audit.
    pub fn build(payload: &MatchPayload, result: &Evaluation) -> Self {
        let empty = crate::matches::Opportunity {
            direction: crate::matches::Direction::BuyYesPmBuyNoKalshi,
            quantity: 0.0,
            profit_usd: 0.0,
            total_cost_usd: 0.0,
            budget_usd: 0.0,
            kalshi_fees_usd: 0.0,
            polymarket_fees_usd: 0.0,
            legs: vec![],
        };
        let best = result.best.as_ref().unwrap_or(&empty);
        Self {
            pair_id: payload.pair_id.clone(),
            source_venue: payload.source.venue.to_string(),
            source_market_id: payload.source.market.market_id.clone(),
            source_question: payload.source.market.question.clone(),
            source_yes_price: payload.source.market.price.yes_ask,
            source_no_price: payload.source.market.price.no_ask,
            target_venue: payload.target.venue.to_string(),
            target_market_id: payload.target.market.market_id.clone(),
            target_question: payload.target.market.question.clone(),
            target_yes_price: payload.target.market.price.yes_ask,
            target_no_price: payload.target.market.price.no_ask,
            similarity: payload.similarity,
            distance: payload.distance,
            matched_at: payload.matched_at.to_rfc3339(),
            direction: if result.best.is_some() {
                best.direction.to_string()
            } else {
                String::new()
            },
            qty_contracts: best.quantity,
            total_cost_usd: best.total_cost_usd,
            profit_usd: best.profit_usd,
            budget_usd: best.budget_usd,
            kalshi_fees_usd: best.kalshi_fees_usd,
            polymarket_fees_usd: best.polymarket_fees_usd,
            legs_json: serde_json::to_string(&best.legs).unwrap_or_default(),
            raw_payload_json: serde_json::to_string(payload).unwrap_or_default(),
        }
    }
}

/// Channel handle for sending storage messages (non-blocking).
#[derive(Clone)]
pub struct StorageChannel {
    tx: Sender<StorageMessage>,
}

impl StorageChannel {
    /// Upsert one collection cycle's events.
    pub fn record_events(&self, venue: Venue, events: Vec<Event>) {
        let _ = self.tx.send(StorageMessage::Markets(venue, events));
    }

    /// Record an evaluated opportunity.
    pub fn record_opportunity(&self, payload: &MatchPayload, result: &Evaluation) {
        let row = OpportunityRow::build(payload, result);
        let _ = self.tx.send(StorageMessage::Opportunity(Box::new(row)));
    }

    /// Request graceful shutdown; the writer flushes pending work first.
    pub fn shutdown(&self) {
        let _ = self.tx.send(StorageMessage::Shutdown);
    }
}

/// Create a storage channel and spawn the writer thread. The channel can be
/// cloned and shared across tasks.
pub fn create_storage_channel(db_path: &str) -> StorageChannel {
    let (tx, rx) = mpsc::channel();
    let path = db_path.to_string();

    // Dedicated writer thread, isolated from the async runtime
    thread::spawn(move || {
        storage_writer_loop(rx, &path);
    });

    StorageChannel { tx }
}

fn storage_writer_loop(rx: Receiver<StorageMessage>, db_path: &str) {
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    let conn = match Connection::open(db_path) {
        Ok(conn) => conn,
        Err(err) => {
            error!("[storage] failed to open database at {db_path}: {err}");
            return;
        }
    };
    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        warn!("[storage] could not enable WAL: {err}");
    }
    if let Err(err) = create_tables(&conn) {
        error!("[storage] failed to create tables: {err}");
        return;
    }
    info!("[storage] database initialized at {db_path}");

    let mut batch: Vec<StorageMessage> = Vec::with_capacity(64);
    let batch_timeout = Duration::from_millis(100);

    loop {
        match rx.recv_timeout(batch_timeout) {
            Ok(StorageMessage::Shutdown) => {
                flush_batch(&conn, &mut batch);
                info!("[storage] writer shutdown complete");
                break;
            }
            Ok(msg) => {
                batch.push(msg);
                if batch.len() >= 64 {
                    flush_batch(&conn, &mut batch);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                flush_batch(&conn, &mut batch);
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                flush_batch(&conn, &mut batch);
                info!("[storage] channel disconnected, writer exiting");
                break;
            }
        }
    }
}

fn flush_batch(conn: &Connection, batch: &mut Vec<StorageMessage>) {
    if batch.is_empty() {
        return;
    }
    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(err) => {
            error!("[storage] failed to start transaction: {err}");
            batch.clear();
            return;
        }
    };

    let mut market_count = 0usize;
    let mut opp_count = 0usize;

    for msg in batch.drain(..) {
        match msg {
            StorageMessage::Markets(venue, events) => {
                let now = chrono::Utc::now().to_rfc3339();
                for event in &events {
                    for market in &event.markets {
                        if upsert_market(&tx, venue, event, market, &now) {
                            market_count += 1;
                        }
                    }
                }
            }
            StorageMessage::Opportunity(row) => {
                if insert_opportunity(&tx, &row) {
                    opp_count += 1;
                }
            }
            StorageMessage::Shutdown => {}
        }
    }

    if let Err(err) = tx.commit() {
        error!("[storage] failed to commit transaction: {err}");
    } else if market_count > 0 || opp_count > 0 {
        info!("[storage] flushed {market_count} market upserts, {opp_count} opportunities");
    }
}

const UPSERT_MARKET_SQL: &str = "
INSERT INTO markets (
    venue, market_id, event_id, event_title, event_description, event_category, event_status,
    resolution_source, resolution_details, settlement_sources_json, contract_terms_url,
    question, subtitle, reference_url, close_time, tick_size, yes_bid, yes_ask, no_bid, no_ask,
    volume, volume_24h, open_interest, clob_token_yes, clob_token_no,
    yes_bids_json, yes_asks_json, no_bids_json, no_asks_json, book_captured_at, book_hash,
    text_hash, resolution_hash, last_seen_at, raw_json
) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27,?28,?29,?30,?31,?32,?33,?34,?35)
ON CONFLICT(venue, market_id) DO UPDATE SET
    event_id=excluded.event_id,
    event_title=excluded.event_title,
    event_description=excluded.event_description,
    event_category=excluded.event_category,
    event_status=excluded.event_status,
    resolution_source=excluded.resolution_source,
    resolution_details=excluded.resolution_details,
    settlement_sources_json=excluded.settlement_sources_json,
    contract_terms_url=excluded.contract_terms_url,
    question=excluded.question,
    subtitle=excluded.subtitle,
    reference_url=excluded.reference_url,
    close_time=excluded.close_time,
    tick_size=excluded.tick_size,
    yes_bid=excluded.yes_bid,
    yes_ask=excluded.yes_ask,
    no_bid=excluded.no_bid,
    no_ask=excluded.no_ask,
    volume=excluded.volume,
    volume_24h=excluded.volume_24h,
    open_interest=excluded.open_interest,
    clob_token_yes=excluded.clob_token_yes,
    clob_token_no=excluded.clob_token_no,
    yes_bids_json=excluded.yes_bids_json,
    yes_asks_json=excluded.yes_asks_json,
    no_bids_json=excluded.no_bids_json,
    no_asks_json=excluded.no_asks_json,
    book_captured_at=excluded.book_captured_at,
    book_hash=excluded.book_hash,
    text_hash=excluded.text_hash,
    resolution_hash=excluded.resolution_hash,
    last_seen_at=excluded.last_seen_at,
    raw_json=excluded.raw_json";

fn upsert_market(
    conn: &Connection,
    venue: Venue,
    event: &Event,
    market: &Market,
    now: &str,
) -> bool {
    let raw_json = serde_json::json!({"event": event, "market": market}).to_string();
    let settlement_json = serde_json::to_string(&event.settlement_sources).unwrap_or_default();
    let text_hash = hash_strings([
        event.title.as_str(),
        event.description.as_str(),
        market.question.as_str(),
        market.subtitle.as_str(),
    ]);
    let resolution_hash = hash_strings([
        event.resolution_source.as_str(),
        event.resolution_details.as_str(),
        event.contract_terms_url.as_str(),
    ]);

    let clob_yes = market.clob_token_ids.first().cloned().unwrap_or_default();
    let clob_no = market.clob_token_ids.get(1).cloned().unwrap_or_default();

    let (yes_book, no_book) = split_orderbooks(market);
    let (yes_bids_json, yes_asks_json) = serialize_orderbook(yes_book.as_ref());
    let (no_bids_json, no_asks_json) = serialize_orderbook(no_book.as_ref());
    let book_hash = hash_strings([
        yes_bids_json.as_str(),
        yes_asks_json.as_str(),
        no_bids_json.as_str(),
        no_asks_json.as_str(),
    ]);

    let close_time = market
        .close_time
        .or(event.close_time)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();

    let result = conn.execute(
        UPSERT_MARKET_SQL,
        rusqlite::params![
            venue.as_str(),
            market.market_id,
            event.event_id,
            event.title,
            event.description,
            event.category,
            event.status,
            event.resolution_source,
            event.resolution_details,
            settlement_json,
            event.contract_terms_url,
            market.question,
            market.subtitle,
            market.reference_url,
            close_time,
            market.tick_size,
            market.price.yes_bid,
            market.price.yes_ask,
            market.price.no_bid,
            market.price.no_ask,
            market.volume,
            market.volume_24h,
            market.open_interest,
            clob_yes,
            clob_no,
            yes_bids_json,
            yes_asks_json,
            no_bids_json,
            no_asks_json,
            now,
            book_hash,
            text_hash,
            resolution_hash,
            now,
            raw_json,
        ],
    );

    match result {
        Ok(_) => true,
        Err(err) => {
            warn!("[storage] failed to upsert market {}: {err}", market.market_id);
            false
        }
    }
}

fn insert_opportunity(conn: &Connection, row: &OpportunityRow) -> bool {
    let processed_at = chrono::Utc::now().to_rfc3339();
    let result = conn.execute(
        "INSERT OR IGNORE INTO arb_opportunities (
            pair_id, source_venue, source_market_id, source_question,
            source_yes_price, source_no_price,
            target_venue, target_market_id, target_question,
            target_yes_price, target_no_price,
            similarity, distance, matched_at, processed_at,
            direction, qty_contracts, total_cost_usd, profit_usd,
            budget_usd, kalshi_fees_usd, polymarket_fees_usd,
            legs_json, raw_payload_json
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24)",
        rusqlite::params![
            row.pair_id,
            row.source_venue,
            row.source_market_id,
            row.source_question,
            row.source_yes_price,
            row.source_no_price,
            row.target_venue,
            row.target_market_id,
            row.target_question,
            row.target_yes_price,
            row.target_no_price,
            row.similarity,
            row.distance,
            row.matched_at,
            processed_at,
            row.direction,
            row.qty_contracts,
            row.total_cost_usd,
            row.profit_usd,
            row.budget_usd,
            row.kalshi_fees_usd,
            row.polymarket_fees_usd,
            row.legs_json,
            row.raw_payload_json,
        ],
    );
    match result {
        Ok(rows) => rows > 0,
        Err(err) => {
            warn!("[storage] failed to insert opportunity {}: {err}", row.pair_id);
            false
        }
    }
}

fn split_orderbooks(market: &Market) -> (Option<Orderbook>, Option<Orderbook>) {
    if market.orderbooks.is_empty() {
        return (None, None);
    }
    let mut yes = market
        .clob_token_ids
        .first()
        .and_then(|token| market.orderbooks.get(token))
        .cloned();
    let mut no = market
        .clob_token_ids
        .get(1)
        .and_then(|token| market.orderbooks.get(token))
        .cloned();
    if yes.is_none() {
        yes = market.orderbooks.get("yes").cloned();
    }
    if no.is_none() {
        no = market.orderbooks.get("no").cloned();
    }
    (yes, no)
}

fn serialize_orderbook(book: Option<&Orderbook>) -> (String, String) {
    match book {
        Some(book) => {
            let bids = if book.bids.is_empty() {
                String::new()
            } else {
                serde_json::to_string(&book.bids).unwrap_or_default()
            };
            let asks = if book.asks.is_empty() {
                String::new()
            } else {
                serde_json::to_string(&book.asks).unwrap_or_default()
            };
            (bids, asks)
        }
        None => (String::new(), String::new()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Level, PriceSnapshot};
    use chrono::Utc;
    use std::collections::HashMap;

    fn test_event(venue: Venue) -> Event {
        let mut orderbooks = HashMap::new();
        orderbooks.insert(
            "yes".to_string(),
            Orderbook {
                bids: vec![Level {
                    price: 0.44,
                    quantity: 10.0,
                    raw_price: 44.0,
                    raw_amount: 10.0,
                }],
                asks: vec![],
            },
        );
        Event {
            venue,
            event_id: "ev-1".into(),
            title: "Title".into(),
            description: "Description".into(),
            category: "Econ".into(),
            status: "open".into(),
            resolution_source: "AP".into(),
            resolution_details: "details".into(),
            settlement_sources: vec![],
            contract_terms_url: String::new(),
            close_time: None,
            markets: vec![Market {
                market_id: "mkt-1".into(),
                question: "Q?".into(),
                price: PriceSnapshot {
                    yes_bid: 0.44,
                    yes_ask: 0.45,
                    no_bid: 0.54,
                    no_ask: 0.55,
                },
                orderbooks,
                ..Market::default()
            }],
            raw: None,
        }
    }

    #[test]
    fn test_upsert_market_twice_keeps_one_row() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        let event = test_event(Venue::Kalshi);
        let now = Utc::now().to_rfc3339();
        assert!(upsert_market(&conn, Venue::Kalshi, &event, &event.markets[0], &now));
        assert!(upsert_market(&conn, Venue::Kalshi, &event, &event.markets[0], &now));

        let count: i64 = conn
            .query_row("SELECT count(*) FROM markets", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1, "upsert must keep one row per (venue, market_id)");
    }

    #[test]
    fn test_opportunity_replay_dedups() {
        use crate::matches::MatchPayload;
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        let pm_event = test_event(Venue::Polymarket);
        let kx_event = test_event(Venue::Kalshi);
        let pm = crate::types::MarketSnapshot::new(
            Venue::Polymarket,
            &pm_event,
            pm_event.markets[0].clone(),
            Utc::now(),
        );
        let kx = crate::types::MarketSnapshot::new(
            Venue::Kalshi,
            &kx_event,
            kx_event.markets[0].clone(),
            Utc::now(),
        );
        let payload = MatchPayload::new(pm, kx, 0.99, 0.01);
        let row = OpportunityRow::build(&payload, &Evaluation::default());

        assert!(insert_opportunity(&conn, &row));
        assert!(!insert_opportunity(&conn, &row), "replay of the same payload is ignored");

        let count: i64 = conn
            .query_row("SELECT count(*) FROM arb_opportunities", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_split_orderbooks_falls_back_to_outcome_keys() {
        let event = test_event(Venue::Kalshi);
        let (yes, no) = split_orderbooks(&event.markets[0]);
        assert!(yes.is_some(), "kalshi books are keyed yes/no");
        assert!(no.is_none());
    }
}
