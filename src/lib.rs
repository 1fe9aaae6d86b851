//! Cross-venue prediction-market arbitrage detection pipeline.
//!
//! Detects risk-free arbitrage between Polymarket and Kalshi binary markets:
//! collectors poll both venues and publish market snapshots to Kafka topics,
//! embedding workers index each snapshot into a vector store and retrieve
//! near-duplicate markets on the opposite venue, an LLM validator gates pairs
//! on resolution semantics, and an order-book walking simulator computes the
//! best executable opportunity under a USD budget.
//!
//! ## Stages
//!
//! - **Collectors** (`polymarket_collector`, `kalshi_collector`): poll venue
//!   REST APIs, persist markets, publish one `MarketSnapshot` per market.
//! - **Embedding/indexer workers** (`polymarket_worker`, `kalshi_worker`):
//!   embed snapshot text, upsert into the vector store; the Polymarket side
//!   additionally emits cross-venue match candidates.
//! - **Snapshot worker** (`snapshot_worker`): quick order-book simulation,
//!   verdict-cache gate, LLM validation, fresh re-fetch, final simulation,
//!   durable persistence.
//!
//! Caches (embeddings, verdicts) make every stage idempotent under the log's
//! at-least-once delivery.

pub mod arb;
pub mod cache;
pub mod chroma;
pub mod collectors;
pub mod config;
pub mod embed;
pub mod hash;
pub mod indexer;
pub mod kalshi;
pub mod llm;
pub mod matcher;
pub mod matches;
pub mod polymarket;
pub mod queue;
pub mod storage;
pub mod types;
pub mod validator;
pub mod workers;
