//! Content-addressed identities: pair IDs, text digests, and cache keys.
//!
//! Every expensive external call (embedding, LLM verdict) is memoized under a
//! SHA-256 digest of the text that influenced it, so caches invalidate exactly
//! when resolution-affecting content changes.

use sha2::{Digest, Sha256};

use crate::types::MarketSnapshot;

/// SHA-256 over the parts with newline separators, hex-encoded.
pub fn hash_strings<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update(b"\n");
    }
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Digest of every text field that affects resolution semantics.
pub fn text_digest(snap: &MarketSnapshot) -> String {
    hash_strings([
        snap.event.title.as_str(),
        snap.market.question.as_str(),
        snap.market.subtitle.as_str(),
        snap.event.description.as_str(),
        snap.event.resolution_source.as_str(),
        snap.event.resolution_details.as_str(),
        snap.event.contract_terms_url.as_str(),
    ])
}

/// Order-independent verdict cache key for a pair.
///
/// Both halves carry the snapshot's text digest, so the key invalidates
/// precisely when resolution-affecting text changes on either side.
pub fn verdict_cache_key(a: &MarketSnapshot, b: &MarketSnapshot) -> String {
    let left = format!("{}:{}:{}", a.venue, a.market.market_id, text_digest(a));
    let right = format!("{}:{}:{}", b.venue, b.market.market_id, text_digest(b));
    let mut parts = [left, right];
    parts.sort();
    format!("{}|{}", parts[0], parts[1])
}

/// Canonical, direction-independent identity of a cross-venue pair.
pub fn pair_id(a: &MarketSnapshot, b: &MarketSnapshot) -> String {
    let left = format!("{}:{}", a.venue, a.market.market_id);
    let right = format!("{}:{}", b.venue, b.market.market_id);
    let mut parts = [left, right];
    parts.sort();
    hash_strings(parts.iter())
}

/// Cache key for one snapshot's embedding vector.
pub fn embedding_cache_key(snap: &MarketSnapshot, embedding_text: &str) -> String {
    format!(
        "{}:{}:{}",
        snap.venue,
        snap.market.market_id,
        hash_strings([embedding_text])
    )
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, Market, Venue};
    use chrono::Utc;

    fn snap(venue: Venue, market_id: &str, title: &str) -> MarketSnapshot {
        let event = Event {
            venue,
            event_id: format!("ev-{market_id}"),
            title: title.into(),
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
    fn test_hash_strings_known_vector() {
        // sha256("alpha\nbeta\n")
        assert_eq!(
            hash_strings(["alpha", "beta"]),
            "e49c81e2d2f84e259d40e2fb8192f3bcd198b355184845d76d8f58807d0d78ee"
        );
        // sha256("\n") - a single empty part still contributes its separator
        assert_eq!(
            hash_strings([""]),
            "01ba4719c80b6fe911b091a7c05124b64eeece964e09c058ef8f9805daca546b"
        );
    }

    #[test]
    fn test_pair_id_hashes_sorted_halves() {
        let a = snap(Venue::Polymarket, "mkt-1", "A");
        let b = snap(Venue::Kalshi, "mkt-2", "B");
        let id = pair_id(&a, &b);
        assert_eq!(id.len(), 64);
        // "kalshi:mkt-2" sorts before "polymarket:mkt-1", so the digest is
        // over the sorted halves, not input order.
        assert_eq!(id, hash_strings(["kalshi:mkt-2", "polymarket:mkt-1"]));
        assert_ne!(
            id,
            "adb169e5bc530c05a5e18ef658a78b48e8440ea212f7dd74699cbf4ec4c3a825",
            "digest of the unsorted order"
        );
    }

    #[test]
    fn test_pair_id_is_direction_independent() {
        let a = snap(Venue::Polymarket, "mkt-1", "Rate cut");
        let b = snap(Venue::Kalshi, "KXFED-26MAR", "Rate cut");
        assert_eq!(pair_id(&a, &b), pair_id(&b, &a));
    }

    #[test]
    fn test_verdict_cache_key_is_symmetric() {
        let a = snap(Venue::Polymarket, "mkt-1", "Rate cut");
        let b = snap(Venue::Kalshi, "KXFED-26MAR", "Rate cut");
        assert_eq!(verdict_cache_key(&a, &b), verdict_cache_key(&b, &a));
    }

    #[test]
    fn test_verdict_cache_key_changes_with_text() {
        let a = snap(Venue::Polymarket, "mkt-1", "Rate cut");
        let b = snap(Venue::Kalshi, "KXFED-26MAR", "Rate cut");
        let mut b2 = b.clone();
        b2.event.resolution_details = "amended rules".into();
        assert_ne!(
            verdict_cache_key(&a, &b),
            verdict_cache_key(&a, &b2),
            "resolution text change must invalidate the verdict key"
        );
    }

    #[test]
    fn test_pair_id_ignores_text_changes() {
        let a = snap(Venue::Polymarket, "mkt-1", "Rate cut");
        let b = snap(Venue::Kalshi, "KXFED-26MAR", "Rate cut");
        let mut b2 = b.clone();
        b2.event.description = "different description".into();
        assert_eq!(pair_id(&a, &b), pair_id(&a, &b2), "pair identity is venue:market only");
    }

    #[test]
    fn test_embedding_cache_key_shape() {
        let a = snap(Venue::Kalshi, "KXFED-26MAR", "Rate cut");
        let key = embedding_cache_key(&a, "Rate cut\nSettle date: 2026-03-18");
        let parts: Vec<&str> = key.splitn(3, ':').collect();
        assert_eq!(parts[0], "kalshi");
        assert_eq!(parts[1], "KXFED-26MAR");
        assert_eq!(parts[2].len(), 64);
        assert_eq!(
            parts[2],
            hash_strings(["Rate cut\nSettle date: 2026-03-18"]),
        );
    }
}
