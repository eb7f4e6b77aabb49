//! Optimistic writes and their reconciliation with the server.

use tracing::{debug, warn};

use super::engine::SyncEngine;
use crate::cache::{CacheEntry, Syncable};
use crate::error::SyncError;

/// Record of an optimistic write awaiting confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation<T> {
  pub key: String,
  pub optimistic_value: T,
  /// `None` if the key was not cached before the mutation
  pub previous_value: Option<T>,
  /// Cache revision of the optimistic write
  pub revision: u64,
}

/// How a confirm or rollback was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
  /// The cache now holds the confirmed or restored value
  Applied,
  /// A newer write landed first and was kept
  Superseded,
}

impl Resolution {
  /// For callers that treat a discarded stale write as an error.
  pub fn into_result(self) -> Result<(), SyncError> {
    match self {
      Resolution::Applied => Ok(()),
      Resolution::Superseded => Err(SyncError::StaleWriteConflict),
    }
  }
}

/// Handle for one optimistic write.
///
/// Resolve it with [`confirm`](Self::confirm) or [`rollback`](Self::rollback).
/// Dropping it unresolved rolls back, so the cache is never left holding a
/// value the server has not accepted.
#[must_use = "an unresolved optimistic update is rolled back on drop"]
pub struct OptimisticUpdate<T: Syncable> {
  engine: SyncEngine<T>,
  written: CacheEntry<T>,
  previous: Option<CacheEntry<T>>,
  resolved: bool,
}

impl<T: Syncable> OptimisticUpdate<T> {
  pub(super) fn new(
    engine: SyncEngine<T>,
    written: CacheEntry<T>,
    previous: Option<CacheEntry<T>>,
  ) -> Self {
    Self {
      engine,
      written,
      previous,
      resolved: false,
    }
  }

  pub fn key(&self) -> &str {
    &self.written.key
  }

  /// The optimistically written value.
  pub fn value(&self) -> &T {
    &self.written.value
  }

  pub fn revision(&self) -> u64 {
    self.written.revision
  }

  /// Replace the optimistic value with the server's authoritative one.
  ///
  /// If the optimistic write is no longer the current entry, the
  /// confirmation is stale and is dropped.
  pub fn confirm(mut self, server_value: T) -> Resolution {
    self.resolved = true;
    let key = self.written.key.clone();

    let resolution = {
      let mut cache = self.engine.inner.cache.lock();
      if self.superseded(cache.peek(&key)) {
        Resolution::Superseded
      } else {
        cache.set(&key, server_value);
        Resolution::Applied
      }
    };

    if resolution == Resolution::Superseded {
      warn!(key = %key, "stale confirmation discarded, newer value already cached");
    } else {
      debug!(key = %key, "optimistic value confirmed");
    }
    self.clear_pending();
    resolution
  }

  /// Restore the value cached before the optimistic write.
  ///
  /// If a newer write already replaced the optimistic value, that newer value
  /// is kept.
  pub fn rollback(mut self) -> Resolution {
    self.resolve_by_rollback()
  }

  fn resolve_by_rollback(&mut self) -> Resolution {
    self.resolved = true;
    let key = self.written.key.clone();

    let resolution = {
      let mut cache = self.engine.inner.cache.lock();
      if self.superseded(cache.peek(&key)) {
        Resolution::Superseded
      } else {
        match self.previous.clone() {
          Some(entry) => {
            cache.restore(entry);
          }
          None => {
            cache.remove(&key);
          }
        }
        Resolution::Applied
      }
    };

    debug!(key = %key, ?resolution, "optimistic value rolled back");
    self.clear_pending();
    resolution
  }

  /// Our own write must still be current; any later write or removal wins.
  fn superseded(&self, current: Option<CacheEntry<T>>) -> bool {
    current.map_or(true, |entry| entry.revision != self.written.revision)
  }

  fn clear_pending(&self) {
    let mut pending = self.engine.inner.pending.lock();
    let ours = pending
      .get(&self.written.key)
      .is_some_and(|p| p.revision == self.written.revision);
    if ours {
      pending.remove(&self.written.key);
    }
  }
}

impl<T: Syncable> Drop for OptimisticUpdate<T> {
  fn drop(&mut self) {
    if !self.resolved {
      self.resolve_by_rollback();
    }
  }
}
