//! Wall-clock source shared by the caches, the cookie jar and token checks.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Source of the current time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Arc::new(Mutex::new(start)),
    }
  }

  /// Start at the Unix epoch, which makes `t=<millis>` assertions easy to read.
  pub fn at_epoch() -> Self {
    Self::new(DateTime::<Utc>::UNIX_EPOCH)
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock();
    *now += by;
  }

  pub fn set(&self, to: DateTime<Utc>) {
    *self.now.lock() = to;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock()
  }
}

/// Shared, dynamically dispatched clock handle.
pub type SharedClock = Arc<dyn Clock>;

pub fn system() -> SharedClock {
  Arc::new(SystemClock)
}
