//! Sync engine that orchestrates caching, request collapsing and fetching.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::dedup::{DedupKey, Method, RequestDeduplicator};
use super::optimistic::{OptimisticUpdate, PendingMutation};
use super::scheduler::Liveness;
use crate::auth::session::{SessionBus, SessionEvent, SessionScoped};
use crate::cache::{CacheConfig, CacheEntry, Syncable, TtlCache};
use crate::clock::SharedClock;
use crate::error::SyncError;

/// Tunables for one [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
  pub cache: CacheConfig,
  /// Oldest cached value a silent sync may serve without fetching
  pub cache_max_age: chrono::Duration,
  /// Deadline for every fetch and mutation request
  pub request_timeout: Duration,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      cache: CacheConfig::default(),
      cache_max_age: chrono::Duration::seconds(90),
      request_timeout: Duration::from_secs(10),
    }
  }
}

/// How a sync was requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
  /// Background syncs may be served from cache and never surface errors
  pub silent: bool,
}

impl SyncOptions {
  pub fn silent() -> Self {
    Self { silent: true }
  }

  pub fn foreground() -> Self {
    Self { silent: false }
  }
}

/// Per-key bookkeeping, written only by the sync path for that key.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
  pub key: String,
  pub last_synced_at: Option<DateTime<Utc>>,
  pub is_syncing: bool,
  pub last_error: Option<SyncError>,
}

impl SyncState {
  fn new(key: &str) -> Self {
    Self {
      key: key.to_string(),
      last_synced_at: None,
      is_syncing: false,
      last_error: None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  Up,
  Down,
}

/// A tracked counter moved between two successful syncs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
  pub key: String,
  /// Absolute size of the change
  pub delta: i64,
  pub direction: Direction,
}

pub(super) struct Inner<T> {
  pub(super) cache: Mutex<TtlCache<T>>,
  dedup: RequestDeduplicator,
  states: Mutex<HashMap<String, SyncState>>,
  /// Last outcome per key, read by callers that collapsed onto a fetch
  settled: Mutex<HashMap<String, Result<T, SyncError>>>,
  pub(super) pending: Mutex<HashMap<String, PendingMutation<T>>>,
  changes: broadcast::Sender<ChangeEvent>,
  session: Option<SessionBus>,
  live: Liveness,
  config: SyncConfig,
}

/// Keeps cached views of server resources fresh.
///
/// Clones share the same cache and in-flight table. Each resource key moves
/// through `Idle -> Syncing -> Idle`; at most one fetch per key runs at a time,
/// while different keys sync independently and complete in any order.
pub struct SyncEngine<T> {
  pub(super) inner: Arc<Inner<T>>,
}

impl<T> Clone for SyncEngine<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Syncable> SyncEngine<T> {
  pub fn new(config: SyncConfig, clock: SharedClock) -> Self {
    Self::build(config, clock, None)
  }

  /// Like `new`, but `AuthExpired` failures are also published on `bus`.
  pub fn with_session_bus(config: SyncConfig, clock: SharedClock, bus: SessionBus) -> Self {
    Self::build(config, clock, Some(bus))
  }

  fn build(config: SyncConfig, clock: SharedClock, session: Option<SessionBus>) -> Self {
    let (changes, _rx) = broadcast::channel(64);
    Self {
      inner: Arc::new(Inner {
        cache: Mutex::new(TtlCache::new(config.cache.clone(), clock)),
        dedup: RequestDeduplicator::new(),
        states: Mutex::new(HashMap::new()),
        settled: Mutex::new(HashMap::new()),
        pending: Mutex::new(HashMap::new()),
        changes,
        session,
        live: Liveness::new(),
        config,
      }),
    }
  }

  pub fn config(&self) -> &SyncConfig {
    &self.inner.config
  }

  /// Bring `key` up to date.
  ///
  /// A silent sync returns a cached value younger than `cache_max_age`
  /// without touching the network. Otherwise the fetcher runs under the
  /// request timeout, unless a fetch for the key is already in flight, in
  /// which case this call waits for that fetch and returns its outcome.
  ///
  /// Failures never replace a cached value. Foreground failures are recorded
  /// in the key's `SyncState` and returned; silent ones are only logged.
  pub async fn sync_now<F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    options: SyncOptions,
  ) -> Result<T, SyncError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
  {
    self.ensure_alive()?;

    if options.silent {
      let hit = self
        .inner
        .cache
        .lock()
        .get(key, self.inner.config.cache_max_age);
      if let Some(value) = hit {
        debug!(key, "silent sync served from cache");
        return Ok(value);
      }
    }

    let dedup_key = DedupKey::new(Method::Get, key);
    let Some(_guard) = self.inner.dedup.guard(&dedup_key) else {
      debug!(key, "sync already in flight, joining it");
      self.inner.dedup.wait(&dedup_key).await;
      return self.joined_outcome(key);
    };

    self.inner.settled.lock().remove(key);
    self.set_syncing(key, true);

    let timeout = self.inner.config.request_timeout;
    let outcome = match tokio::time::timeout(timeout, fetcher()).await {
      Ok(result) => result,
      Err(_) => Err(SyncError::Timeout(timeout)),
    };

    if !self.inner.live.is_alive() {
      debug!(key, "discarding sync result for disposed engine");
      return Err(SyncError::Disposed);
    }

    let result = match outcome {
      Ok(value) => {
        self.store_fetched(key, value.clone());
        Ok(value)
      }
      Err(error) => {
        self.record_failure(key, &error, options.silent);
        Err(error)
      }
    };

    self
      .inner
      .settled
      .lock()
      .insert(key.to_string(), result.clone());
    result
  }

  /// Write `mutate(current)` to the cache immediately.
  ///
  /// The returned handle must be confirmed with the server's value or rolled
  /// back; dropping it unresolved rolls back. Only one optimistic write per
  /// key may be outstanding; a second one fails with `InFlight` and leaves
  /// the cache untouched.
  pub fn apply_optimistic<M>(&self, key: &str, mutate: M) -> Result<OptimisticUpdate<T>, SyncError>
  where
    M: FnOnce(Option<&T>) -> T,
  {
    let mut pending = self.inner.pending.lock();
    if pending.contains_key(key) {
      debug!(key, "optimistic write already pending");
      return Err(SyncError::InFlight);
    }

    let (previous, written) = {
      let mut cache = self.inner.cache.lock();
      let previous = cache.peek(key);
      let optimistic = mutate(previous.as_ref().map(|e| &e.value));
      let written = cache.set(key, optimistic);
      (previous, written)
    };

    pending.insert(
      key.to_string(),
      PendingMutation {
        key: key.to_string(),
        optimistic_value: written.value.clone(),
        previous_value: previous.as_ref().map(|e| e.value.clone()),
        revision: written.revision,
      },
    );
    drop(pending);

    debug!(key, revision = written.revision, "applied optimistic value");
    Ok(OptimisticUpdate::new(self.clone(), written, previous))
  }

  /// Optimistically apply a mutation and reconcile it with the server.
  ///
  /// Only one mutation per key may be in flight; a concurrent duplicate fails
  /// with `InFlight` and leaves the cache untouched. On failure the
  /// optimistic value is rolled back before the error is returned.
  pub async fn mutate<M, R, Fut>(&self, key: &str, optimistic: M, request: R) -> Result<T, SyncError>
  where
    M: FnOnce(Option<&T>) -> T,
    R: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
  {
    self.ensure_alive()?;

    let dedup_key = DedupKey::new(Method::Post, key);
    let Some(_guard) = self.inner.dedup.guard(&dedup_key) else {
      debug!(key, "duplicate mutation rejected");
      return Err(SyncError::InFlight);
    };

    let update = self.apply_optimistic(key, optimistic)?;

    let timeout = self.inner.config.request_timeout;
    let outcome = match tokio::time::timeout(timeout, request()).await {
      Ok(result) => result,
      Err(_) => Err(SyncError::Timeout(timeout)),
    };

    if !self.inner.live.is_alive() {
      return Err(SyncError::Disposed);
    }

    match outcome {
      Ok(server_value) => {
        update.confirm(server_value.clone());
        Ok(server_value)
      }
      Err(error) => {
        update.rollback();
        warn!(key, %error, "mutation failed, rolled back");
        if error.is_auth_expired() {
          self.handle_auth_expired();
        }
        Err(error)
      }
    }
  }

  /// The cached value for `key`, regardless of age.
  pub fn cached(&self, key: &str) -> Option<T> {
    self.inner.cache.lock().peek(key).map(|e| e.value)
  }

  pub fn entry(&self, key: &str) -> Option<CacheEntry<T>> {
    self.inner.cache.lock().peek(key)
  }

  pub fn state(&self, key: &str) -> Option<SyncState> {
    self.inner.states.lock().get(key).cloned()
  }

  pub fn pending(&self, key: &str) -> Option<PendingMutation<T>> {
    self.inner.pending.lock().get(key).cloned()
  }

  pub fn is_syncing(&self, key: &str) -> bool {
    self
      .inner
      .dedup
      .is_busy(&DedupKey::new(Method::Get, key))
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
    self.inner.changes.subscribe()
  }

  /// Drop every cached value and outcome whose key starts with `prefix`.
  pub fn invalidate_prefix(&self, prefix: &str) {
    let removed = self.inner.cache.lock().invalidate_prefix(prefix);
    self
      .inner
      .settled
      .lock()
      .retain(|k, _| !k.starts_with(prefix));
    debug!(prefix, removed, "invalidated cache prefix");
  }

  /// Forget all cached data, states and pending mutations.
  pub fn clear(&self) {
    self.inner.cache.lock().clear();
    self.inner.states.lock().clear();
    self.inner.settled.lock().clear();
    self.inner.pending.lock().clear();
  }

  /// Tear the engine down. Results still in flight are discarded on arrival.
  pub fn dispose(&self) {
    self.inner.live.kill();
    self.clear();
    debug!("sync engine disposed");
  }

  pub fn is_disposed(&self) -> bool {
    !self.inner.live.is_alive()
  }

  fn ensure_alive(&self) -> Result<(), SyncError> {
    if self.inner.live.is_alive() {
      Ok(())
    } else {
      Err(SyncError::Disposed)
    }
  }

  fn set_syncing(&self, key: &str, syncing: bool) {
    let mut states = self.inner.states.lock();
    states
      .entry(key.to_string())
      .or_insert_with(|| SyncState::new(key))
      .is_syncing = syncing;
  }

  fn store_fetched(&self, key: &str, value: T) {
    let (before, stored) = {
      let mut cache = self.inner.cache.lock();
      let before = cache.peek(key).and_then(|e| e.value.tracked_count());
      (before, cache.set(key, value))
    };

    {
      let mut states = self.inner.states.lock();
      let state = states
        .entry(key.to_string())
        .or_insert_with(|| SyncState::new(key));
      state.is_syncing = false;
      state.last_synced_at = Some(stored.stored_at);
      state.last_error = None;
    }

    let after = stored.value.tracked_count();
    if let (Some(before), Some(after)) = (before, after) {
      if before != after {
        let event = ChangeEvent {
          key: key.to_string(),
          delta: i64::try_from(after.abs_diff(before)).unwrap_or(i64::MAX),
          direction: if after > before {
            Direction::Up
          } else {
            Direction::Down
          },
        };
        info!(key, delta = event.delta, direction = ?event.direction, "tracked value changed");
        // Nobody listening is fine
        let _ = self.inner.changes.send(event);
      }
    }
  }

  fn record_failure(&self, key: &str, error: &SyncError, silent: bool) {
    {
      let mut states = self.inner.states.lock();
      let state = states
        .entry(key.to_string())
        .or_insert_with(|| SyncState::new(key));
      state.is_syncing = false;
      if !silent {
        state.last_error = Some(error.clone());
      }
    }

    if silent {
      warn!(key, %error, "background sync failed, keeping cached value");
    } else {
      warn!(key, %error, "sync failed");
    }

    if error.is_auth_expired() {
      self.handle_auth_expired();
    }
  }

  fn handle_auth_expired(&self) {
    warn!("authentication expired, clearing sync cache");
    self.clear();
    if let Some(bus) = &self.inner.session {
      bus.publish(SessionEvent::AuthExpired);
    }
  }

  /// Outcome for a caller that waited on someone else's fetch.
  fn joined_outcome(&self, key: &str) -> Result<T, SyncError> {
    self.ensure_alive()?;
    if let Some(outcome) = self.inner.settled.lock().get(key).cloned() {
      return outcome;
    }
    // The fetch we waited on was abandoned before it settled
    self
      .cached(key)
      .ok_or_else(|| SyncError::Network("in-flight request was abandoned".into()))
  }
}

impl<T: Syncable> SessionScoped for SyncEngine<T> {
  fn clear_session_data(&self) {
    self.clear();
  }
}
