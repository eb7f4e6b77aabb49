//! Generic caching layer for frequently-changing server data.
//!
//! This module provides a resource-agnostic cache that:
//! - Stores values with a write timestamp and a default lifetime
//! - Treats reads past a caller-supplied age as misses
//! - Bounds its size with an explicit FIFO or LRU eviction policy
//! - Supports bulk invalidation by key prefix

mod traits;
mod ttl;

pub use traits::{CacheEntry, EvictionPolicy, Syncable};
pub use ttl::{CacheConfig, TtlCache};
