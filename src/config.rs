//! Environment-driven configuration.
//!
//! Every knob has a default so a bare environment still boots against local
//! infrastructure. Missing credentials where required (`EMBED_API_KEY`,
//! `LLM_API_KEY`) are a fatal startup error surfaced by the client
//! constructors.

use std::env;
use std::time::Duration;

// === Fixed endpoints (overridable per client config) ===

/// Polymarket Gamma API events endpoint.
pub const POLYMARKET_API_URL: &str = "https://gamma-api.polymarket.com/events";
/// Polymarket CLOB order book endpoint.
pub const POLYMARKET_BOOK_URL: &str = "https://clob.polymarket.com/book";
/// Kalshi Trade API events endpoint.
pub const KALSHI_API_URL: &str = "https://api.elections.kalshi.com/trade-api/v2/events";
/// Kalshi Trade API series endpoint.
pub const KALSHI_SERIES_URL: &str = "https://api.elections.kalshi.com/trade-api/v2/series";
/// Kalshi Trade API markets endpoint (order books).
pub const KALSHI_MARKET_URL: &str = "https://api.elections.kalshi.com/trade-api/v2/markets";

// === Env helpers ===

pub fn env_string(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(val) if !val.is_empty() => val,
        _ => default.to_string(),
    }
}

pub fn env_opt_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

// === Stage configuration ===

/// Matcher knobs for the nearest-neighbor retrieval contract.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Candidates requested per query.
    pub top_k: usize,
    /// Reject condition is strictly `similarity < threshold`.
    pub threshold: f64,
    /// Maximum admissible snapshot age for a candidate.
    pub freshness: Duration,
    pub debug: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            threshold: 0.95,
            freshness: Duration::from_secs(600),
            debug: false,
        }
    }
}

impl MatcherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut top_k = env_usize("MATCH_TOP_K", defaults.top_k);
        if top_k == 0 {
            top_k = defaults.top_k;
        }
        let mut threshold = env_f64("MATCH_SIMILARITY_THRESHOLD", defaults.threshold);
        if threshold <= 0.0 || threshold > 1.0 {
            threshold = defaults.threshold;
        }
        let freshness_secs = env_u64("MATCH_FRESH_WINDOW_SECONDS", defaults.freshness.as_secs());
        Self {
            top_k,
            threshold,
            freshness: Duration::from_secs(freshness_secs),
            debug: env_bool("MATCH_DEBUG", false),
        }
    }
}

/// Redis cache connection settings shared by all cache kinds.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub addr: String,
    pub password: Option<String>,
    pub db: i64,
    pub ttl: Duration,
}

impl CacheConfig {
    /// Returns `None` when `REDIS_ADDR` is explicitly empty: running without
    /// caches is a valid configuration and every operation degrades to
    /// recompute. An unreachable or malformed address, in contrast, is a
    /// startup fault surfaced by the cache constructors.
    pub fn from_env() -> Option<Self> {
        let addr = match env::var("REDIS_ADDR") {
            Ok(value) if value.trim().is_empty() => return None,
            Ok(value) => value,
            Err(_) => "127.0.0.1:6379".to_string(),
        };
        let ttl_hours = env_u64("CACHE_TTL_HOURS", 240);
        Some(Self {
            addr,
            password: env_opt_string("REDIS_PASSWORD"),
            db: env_i64("REDIS_DB", 0),
            ttl: Duration::from_secs(ttl_hours * 3600),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matcher_defaults() {
        let cfg = MatcherConfig::default();
        assert_eq!(cfg.top_k, 3);
        assert_eq!(cfg.threshold, 0.95);
        assert_eq!(cfg.freshness.as_secs(), 600);
    }

    #[test]
    fn test_env_bool_parsing() {
        std::env::set_var("TEST_CFG_BOOL", "true");
        assert!(env_bool("TEST_CFG_BOOL", false));
        std::env::set_var("TEST_CFG_BOOL", "0");
        assert!(!env_bool("TEST_CFG_BOOL", true));
        std::env::remove_var("TEST_CFG_BOOL");
        assert!(env_bool("TEST_CFG_BOOL", true));
    }

    #[test]
    fn test_env_string_default_on_empty() {
        std::env::set_var("TEST_CFG_STR", "");
        assert_eq!(env_string("TEST_CFG_STR", "fallback"), "fallback");
        std::env::remove_var("TEST_CFG_STR");
    }
}
