//! Bounded in-memory cache with per-entry expiry.

use chrono::Duration;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

use super::traits::{CacheEntry, EvictionPolicy};
use crate::clock::SharedClock;

/// Sizing and expiry settings for a [`TtlCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// Maximum number of entries kept
  pub capacity: usize,
  pub policy: EvictionPolicy,
  /// Lifetime stamped on entries written with `set`
  pub default_ttl: Duration,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      capacity: 100,
      policy: EvictionPolicy::Fifo,
      default_ttl: Duration::seconds(90),
    }
  }
}

struct Slot<V> {
  entry: CacheEntry<V>,
  /// Position in the eviction order
  ticket: u64,
}

/// Key/value store where entries expire by age and the table is bounded.
///
/// Reads past an entry's age limit behave exactly like misses. Eviction order
/// is insertion order under FIFO and access order under LRU.
pub struct TtlCache<V> {
  entries: HashMap<String, Slot<V>>,
  order: BTreeMap<u64, String>,
  next_ticket: u64,
  next_revision: u64,
  config: CacheConfig,
  clock: SharedClock,
}

impl<V: Clone> TtlCache<V> {
  pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
    Self {
      entries: HashMap::new(),
      order: BTreeMap::new(),
      next_ticket: 0,
      next_revision: 0,
      config,
      clock,
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  /// Get a value if it is no older than `max_age`.
  pub fn get(&mut self, key: &str, max_age: Duration) -> Option<V> {
    let now = self.clock.now();
    let fresh = self
      .entries
      .get(key)
      .is_some_and(|slot| !slot.entry.is_expired(now, max_age));

    if !fresh {
      return None;
    }

    if self.config.policy == EvictionPolicy::Lru {
      self.touch(key);
    }
    self.entries.get(key).map(|slot| slot.entry.value.clone())
  }

  /// Get a value if it is within its own ttl.
  pub fn get_fresh(&mut self, key: &str) -> Option<V> {
    let ttl = self.entries.get(key)?.entry.ttl;
    self.get(key, ttl)
  }

  /// The raw entry regardless of age. Does not count as an access.
  pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
    self.entries.get(key).map(|slot| slot.entry.clone())
  }

  pub fn set(&mut self, key: &str, value: V) -> CacheEntry<V> {
    let ttl = self.config.default_ttl;
    self.set_with_ttl(key, value, ttl)
  }

  pub fn set_with_ttl(&mut self, key: &str, value: V, ttl: Duration) -> CacheEntry<V> {
    let entry = CacheEntry {
      key: key.to_string(),
      value,
      stored_at: self.clock.now(),
      ttl,
      revision: self.bump_revision(),
    };
    self.insert(entry.clone());
    entry
  }

  /// Put back a previously observed entry, keeping its value and timestamp.
  ///
  /// The restored entry receives a fresh revision so it orders after anything
  /// it replaced.
  pub fn restore(&mut self, mut entry: CacheEntry<V>) -> CacheEntry<V> {
    entry.revision = self.bump_revision();
    self.insert(entry.clone());
    entry
  }

  pub fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
    let slot = self.entries.remove(key)?;
    self.order.remove(&slot.ticket);
    Some(slot.entry)
  }

  /// Remove every entry whose key starts with `prefix`.
  pub fn invalidate_prefix(&mut self, prefix: &str) -> usize {
    let doomed: Vec<String> = self
      .entries
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect();

    for key in &doomed {
      self.remove(key);
    }
    doomed.len()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
    self.order.clear();
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  fn bump_revision(&mut self) -> u64 {
    self.next_revision += 1;
    self.next_revision
  }

  fn next_ticket(&mut self) -> u64 {
    self.next_ticket += 1;
    self.next_ticket
  }

  fn insert(&mut self, entry: CacheEntry<V>) {
    let key = entry.key.clone();

    match self.entries.get(&key).map(|slot| slot.ticket) {
      Some(old_ticket) => {
        // Overwrites keep their FIFO slot; under LRU a write is an access
        let ticket = if self.config.policy == EvictionPolicy::Lru {
          self.order.remove(&old_ticket);
          let ticket = self.next_ticket();
          self.order.insert(ticket, key.clone());
          ticket
        } else {
          old_ticket
        };
        self.entries.insert(key, Slot { entry, ticket });
      }
      None => {
        let ticket = self.next_ticket();
        self.order.insert(ticket, key.clone());
        self.entries.insert(key, Slot { entry, ticket });
      }
    }

    self.evict_overflow();
  }

  fn touch(&mut self, key: &str) {
    let Some(old_ticket) = self.entries.get(key).map(|slot| slot.ticket) else {
      return;
    };
    self.order.remove(&old_ticket);
    let ticket = self.next_ticket();
    self.order.insert(ticket, key.to_string());
    if let Some(slot) = self.entries.get_mut(key) {
      slot.ticket = ticket;
    }
  }

  fn evict_overflow(&mut self) {
    let capacity = self.config.capacity.max(1);
    while self.entries.len() > capacity {
      let Some((_, victim)) = self.order.pop_first() else {
        break;
      };
      trace!(key = %victim, policy = ?self.config.policy, "evicting cache entry");
      self.entries.remove(&victim);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use std::sync::Arc;

  fn cache(policy: EvictionPolicy, capacity: usize) -> (TtlCache<i64>, ManualClock) {
    let clock = ManualClock::at_epoch();
    let config = CacheConfig {
      capacity,
      policy,
      default_ttl: Duration::milliseconds(90_000),
    };
    (TtlCache::new(config, Arc::new(clock.clone())), clock)
  }

  #[test]
  fn test_expiry_boundary() {
    let (mut cache, clock) = cache(EvictionPolicy::Fifo, 10);
    cache.set("k", 7);

    clock.advance(Duration::milliseconds(89_999));
    assert_eq!(cache.get("k", Duration::milliseconds(90_000)), Some(7));

    clock.advance(Duration::milliseconds(1));
    assert_eq!(cache.get("k", Duration::milliseconds(90_000)), Some(7));

    clock.advance(Duration::milliseconds(1));
    assert_eq!(cache.get("k", Duration::milliseconds(90_000)), None);
  }

  #[test]
  fn test_expired_read_is_a_miss_but_entry_survives() {
    let (mut cache, clock) = cache(EvictionPolicy::Fifo, 10);
    cache.set("k", 1);
    clock.advance(Duration::seconds(5));

    assert_eq!(cache.get("k", Duration::seconds(1)), None);
    // A caller with a wider tolerance still sees it
    assert_eq!(cache.get("k", Duration::seconds(10)), Some(1));
    assert!(cache.peek("k").is_some());
  }

  #[test]
  fn test_get_fresh_uses_entry_ttl() {
    let (mut cache, clock) = cache(EvictionPolicy::Fifo, 10);
    cache.set_with_ttl("short", 1, Duration::seconds(1));
    cache.set("long", 2);

    clock.advance(Duration::seconds(2));

    assert_eq!(cache.get_fresh("short"), None);
    assert_eq!(cache.get_fresh("long"), Some(2));
  }

  #[test]
  fn test_fifo_evicts_oldest_insertion() {
    let (mut cache, _clock) = cache(EvictionPolicy::Fifo, 2);
    cache.set("a", 1);
    cache.set("b", 2);
    // Reading does not save "a" under FIFO
    assert_eq!(cache.get("a", Duration::hours(1)), Some(1));
    cache.set("c", 3);

    assert!(cache.peek("a").is_none());
    assert!(cache.peek("b").is_some());
    assert!(cache.peek("c").is_some());
  }

  #[test]
  fn test_fifo_overwrite_keeps_insertion_slot() {
    let (mut cache, _clock) = cache(EvictionPolicy::Fifo, 2);
    cache.set("a", 1);
    cache.set("b", 2);
    cache.set("a", 10);
    cache.set("c", 3);

    assert!(cache.peek("a").is_none());
    assert_eq!(cache.len(), 2);
  }

  #[test]
  fn test_lru_evicts_least_recently_accessed() {
    let (mut cache, _clock) = cache(EvictionPolicy::Lru, 2);
    cache.set("a", 1);
    cache.set("b", 2);
    assert_eq!(cache.get("a", Duration::hours(1)), Some(1));
    cache.set("c", 3);

    assert!(cache.peek("a").is_some());
    assert!(cache.peek("b").is_none());
    assert!(cache.peek("c").is_some());
  }

  #[test]
  fn test_lru_expired_read_does_not_refresh_order() {
    let (mut cache, clock) = cache(EvictionPolicy::Lru, 2);
    cache.set("a", 1);
    cache.set("b", 2);
    clock.advance(Duration::seconds(10));
    assert_eq!(cache.get("a", Duration::seconds(1)), None);
    cache.set("c", 3);

    assert!(cache.peek("a").is_none());
  }

  #[test]
  fn test_invalidate_prefix() {
    let (mut cache, _clock) = cache(EvictionPolicy::Fifo, 10);
    cache.set("points:1", 1);
    cache.set("points:2", 2);
    cache.set("coupons:1", 3);

    assert_eq!(cache.invalidate_prefix("points:"), 2);
    assert_eq!(cache.len(), 1);
    assert!(cache.peek("coupons:1").is_some());

    // Removed keys no longer occupy eviction slots
    cache.set("x", 0);
    assert_eq!(cache.len(), 2);
  }

  #[test]
  fn test_revisions_increase_and_restore_keeps_timestamp() {
    let (mut cache, clock) = cache(EvictionPolicy::Fifo, 10);
    let first = cache.set("k", 1);
    clock.advance(Duration::seconds(1));
    let second = cache.set("k", 2);
    assert!(second.revision > first.revision);

    let restored = cache.restore(first.clone());
    assert_eq!(restored.value, 1);
    assert_eq!(restored.stored_at, first.stored_at);
    assert!(restored.revision > second.revision);
  }
}
