//! Collapses concurrent identical operations onto a single in-flight one.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// HTTP-style verb used to build dedup keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Post,
  Put,
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Method::Get => write!(f, "GET"),
      Method::Post => write!(f, "POST"),
      Method::Put => write!(f, "PUT"),
    }
  }
}

/// Identifier for one logical operation: method plus resource key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
  pub fn new(method: Method, resource: &str) -> Self {
    Self(format!("{} {}", method, resource))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for DedupKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Tracks which keys have an operation in flight.
///
/// Clones share the same table.
#[derive(Clone, Default)]
pub struct RequestDeduplicator {
  inflight: Arc<Mutex<HashMap<DedupKey, watch::Sender<bool>>>>,
}

impl RequestDeduplicator {
  pub fn new() -> Self {
    Self::default()
  }

  /// Mark `key` busy. Returns false, changing nothing, if it already is.
  pub fn begin(&self, key: &DedupKey) -> bool {
    let mut inflight = self.inflight.lock();
    if inflight.contains_key(key) {
      return false;
    }
    let (tx, _rx) = watch::channel(false);
    inflight.insert(key.clone(), tx);
    true
  }

  /// Clear the busy mark and release any waiters. Safe to call repeatedly.
  pub fn end(&self, key: &DedupKey) {
    let sender = self.inflight.lock().remove(key);
    if let Some(tx) = sender {
      // No receivers is fine
      let _ = tx.send(true);
    }
  }

  pub fn is_busy(&self, key: &DedupKey) -> bool {
    self.inflight.lock().contains_key(key)
  }

  /// Like `begin`, but `end` runs when the returned guard is dropped.
  pub fn guard(&self, key: &DedupKey) -> Option<DedupGuard> {
    self.begin(key).then(|| DedupGuard {
      dedup: self.clone(),
      key: key.clone(),
    })
  }

  /// Wait until the operation currently holding `key` ends.
  ///
  /// Returns immediately if nothing is in flight.
  pub async fn wait(&self, key: &DedupKey) {
    let rx = self.inflight.lock().get(key).map(|tx| tx.subscribe());
    if let Some(mut rx) = rx {
      // A dropped sender also means the operation is over
      let _ = rx.wait_for(|done| *done).await;
    }
  }

  pub fn inflight_count(&self) -> usize {
    self.inflight.lock().len()
  }
}

/// Releases its key on drop, including on error paths and cancellation.
pub struct DedupGuard {
  dedup: RequestDeduplicator,
  key: DedupKey,
}

impl DedupGuard {
  pub fn key(&self) -> &DedupKey {
    &self.key
  }
}

impl Drop for DedupGuard {
  fn drop(&mut self) {
    self.dedup.end(&self.key);
  }
}
