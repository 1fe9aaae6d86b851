//! Database schema creation.

use rusqlite::{Connection, Result};

/// Create all tables and indexes. Idempotent.
pub fn create_tables(conn: &Connection) -> Result<()> {
    // Unified markets table: one row per (venue, market_id), upserted on
    // every collection cycle.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS markets (
            venue TEXT NOT NULL,
            market_id TEXT NOT NULL,
            event_id TEXT,
            event_title TEXT,
            event_description TEXT,
            event_category TEXT,
            event_status TEXT,
            resolution_source TEXT,
            resolution_details TEXT,
            settlement_sources_json TEXT,
            contract_terms_url TEXT,
            question TEXT,
            subtitle TEXT,
            reference_url TEXT,
            close_time TEXT,
            tick_size REAL,
            yes_bid REAL,
            yes_ask REAL,
            no_bid REAL,
            no_ask REAL,
            volume REAL,
            volume_24h REAL,
            open_interest REAL,
            clob_token_yes TEXT,
            clob_token_no TEXT,
            yes_bids_json TEXT,
            yes_asks_json TEXT,
            no_bids_json TEXT,
            no_asks_json TEXT,
            book_captured_at TEXT,
            book_hash TEXT,
            text_hash TEXT,
            resolution_hash TEXT,
            last_seen_at TEXT,
            raw_json TEXT,
            PRIMARY KEY (venue, market_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS markets_event_idx ON markets(venue, event_id)",
        [],
    )?;

    // Append-only record of every evaluated opportunity, with the full
    // payload JSON for replay and denormalized columns for dashboards.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS arb_opportunities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pair_id TEXT NOT NULL,
            source_venue TEXT NOT NULL,
            source_market_id TEXT NOT NULL,
            source_question TEXT,
            source_yes_price REAL,
            source_no_price REAL,
            target_venue TEXT NOT NULL,
            target_market_id TEXT NOT NULL,
            target_question TEXT,
            target_yes_price REAL,
            target_no_price REAL,
            similarity REAL,
            distance REAL,
            matched_at TEXT,
            processed_at TEXT NOT NULL,
            direction TEXT,
            qty_contracts REAL,
            total_cost_usd REAL,
            profit_usd REAL,
            budget_usd REAL,
            kalshi_fees_usd REAL,
            polymarket_fees_usd REAL,
            legs_json TEXT,
            raw_payload_json TEXT
        )",
        [],
    )?;

    // At-least-once delivery replays messages; the same (pair, match epoch)
    // must land exactly one row.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS arb_pair_match_idx
         ON arb_opportunities(pair_id, matched_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS arb_profit_idx ON arb_opportunities(profit_usd DESC)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS arb_processed_idx ON arb_opportunities(processed_at DESC)",
        [],
    )?;

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN ('markets', 'arb_opportunities')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }
}
