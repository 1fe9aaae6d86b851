//! Durable relational store for collected markets and detected opportunities.
//!
//! Authoritative for human inspection, not for pipeline correctness.

pub mod schema;
pub mod store;

pub use store::{create_storage_channel, OpportunityRow, StorageChannel, StorageMessage};
