//! graphgate-cache — tiered result cache for the graph access layer.
//!
//! Four independent LRU + TTL tiers (node, search, relationship, traversal),
//! each bounded by entry count and bytes, share one global memory budget.
//! Entries are tagged with the entity ids they depend on so that a mutation
//! can invalidate every dependent entry without scanning.

pub mod budget;
pub mod coordinator;
pub mod key;
pub mod tier;

pub use budget::MemoryBudget;
pub use coordinator::CacheCoordinator;
pub use key::cache_key;
pub use tier::{CacheTier, PutOutcome, TierStats};
