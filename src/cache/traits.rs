//! Core traits and types for the caching system.

use chrono::{DateTime, Duration, Utc};

/// Trait for values that can be held by the sync engine.
///
/// Implementors may expose one numeric counter (points balance, coupons left)
/// whose changes are reported as deltas.
pub trait Syncable: Clone + Send + Sync + 'static {
  /// The counter tracked for change notifications, if any.
  fn tracked_count(&self) -> Option<i64> {
    None
  }
}

impl Syncable for serde_json::Value {}

/// A single cached value with the metadata needed for expiry and ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
  pub key: String,
  pub value: V,
  /// When the value was written
  pub stored_at: DateTime<Utc>,
  /// Default lifetime used by `get_fresh`
  pub ttl: Duration,
  /// Cache-wide write counter; a strict order over `stored_at`
  pub revision: u64,
}

impl<V> CacheEntry<V> {
  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.stored_at
  }

  /// An entry older than `max_age` is treated as absent.
  pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
    self.age(now) > max_age
  }
}

/// Which entry to drop once the cache is over capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
  /// Oldest insertion goes first
  #[default]
  Fifo,
  /// Least recently read or written goes first
  Lru,
}
