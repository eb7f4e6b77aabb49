//! Visibility-aware recurring poller.
//!
//! Ticks fire only while the page is visible. Hiding the page cancels the
//! timer; showing it again fires one tick immediately and resumes the
//! interval from there.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

/// Shortest interval a poller will tick at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Whether the owning page is currently shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
  Visible,
  Hidden,
}

/// Publisher side of the visibility signal.
pub struct PageVisibility {
  tx: watch::Sender<Visibility>,
}

impl PageVisibility {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(Visibility::Visible);
    Self { tx }
  }

  pub fn set(&self, visibility: Visibility) {
    self.tx.send_replace(visibility);
  }

  pub fn hide(&self) {
    self.set(Visibility::Hidden);
  }

  pub fn show(&self) {
    self.set(Visibility::Visible);
  }

  pub fn current(&self) -> Visibility {
    *self.tx.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<Visibility> {
    self.tx.subscribe()
  }
}

impl Default for PageVisibility {
  fn default() -> Self {
    Self::new()
  }
}

/// Flag telling a callback whether its owner is still mounted.
///
/// Results arriving after teardown must be dropped instead of applied.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
  pub fn new() -> Self {
    Self(Arc::new(AtomicBool::new(true)))
  }

  pub fn is_alive(&self) -> bool {
    self.0.load(Ordering::Acquire)
  }

  pub fn kill(&self) {
    self.0.store(false, Ordering::Release);
  }
}

impl Default for Liveness {
  fn default() -> Self {
    Self::new()
  }
}

/// Starts recurring callbacks gated on page visibility.
#[derive(Clone)]
pub struct PollScheduler {
  visibility: watch::Receiver<Visibility>,
}

impl PollScheduler {
  pub fn new(visibility: watch::Receiver<Visibility>) -> Self {
    Self { visibility }
  }

  /// Start invoking `callback` every `interval` while visible.
  ///
  /// The callback receives the handle's liveness flag. Ticks never overlap:
  /// the next tick is scheduled only after the current callback returns.
  pub fn start<F, Fut>(&self, callback: F, interval: Duration) -> PollHandle
  where
    F: Fn(Liveness) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let interval = interval.max(MIN_INTERVAL);
    let live = Liveness::new();
    let visibility = self.visibility.clone();
    debug!(interval_ms = interval.as_millis() as u64, "starting poller");

    let task = tokio::spawn(run(callback, interval, visibility, live.clone()));

    PollHandle {
      task: Some(task),
      live,
      interval,
    }
  }

  /// Cancel the timer and drop the visibility subscription.
  pub fn stop(&self, handle: PollHandle) {
    handle.stop();
  }
}

async fn run<F, Fut>(
  callback: F,
  period: Duration,
  mut visibility: watch::Receiver<Visibility>,
  live: Liveness,
) where
  F: Fn(Liveness) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  // First tick completes immediately
  let mut ticker = tokio::time::interval(period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    let visible = *visibility.borrow_and_update() == Visibility::Visible;

    if !visible {
      trace!("page hidden, polling paused");
      if visibility
        .wait_for(|v| *v == Visibility::Visible)
        .await
        .is_err()
      {
        break;
      }
      trace!("page visible, polling resumed");
      ticker.reset_immediately();
      continue;
    }

    tokio::select! {
      _ = ticker.tick() => {
        if !live.is_alive() {
          break;
        }
        callback(live.clone()).await;
      }
      changed = visibility.changed() => {
        if changed.is_err() {
          break;
        }
      }
    }
  }
}

/// Cancellation handle for a running poller. Dropping it stops the poller.
pub struct PollHandle {
  task: Option<JoinHandle<()>>,
  live: Liveness,
  interval: Duration,
}

impl PollHandle {
  pub fn liveness(&self) -> Liveness {
    self.live.clone()
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  pub fn is_running(&self) -> bool {
    self.task.as_ref().is_some_and(|t| !t.is_finished())
  }

  pub fn stop(self) {
    drop(self);
  }
}

impl Drop for PollHandle {
  fn drop(&mut self) {
    self.live.kill();
    if let Some(task) = self.task.take() {
      task.abort();
      debug!("poller stopped");
    }
  }
}

/// Interval policy that backs off while data is quiet.
///
/// After `widen_after` consecutive successful cycles without a change the
/// interval is multiplied by `factor`, capped at `max`. A change snaps it back
/// to `base`; a failure only restarts the streak.
#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
  base: Duration,
  max: Duration,
  widen_after: u32,
  factor: u32,
  current: Duration,
  streak: u32,
}

impl AdaptiveInterval {
  pub fn new(base: Duration, max: Duration, widen_after: u32) -> Self {
    let base = base.max(MIN_INTERVAL);
    Self {
      base,
      max: max.max(base),
      widen_after: widen_after.max(1),
      factor: 2,
      current: base,
      streak: 0,
    }
  }

  pub fn with_factor(mut self, factor: u32) -> Self {
    self.factor = factor.max(1);
    self
  }

  pub fn current(&self) -> Duration {
    self.current
  }

  /// Returns true if the interval was widened.
  pub fn record_success(&mut self) -> bool {
    self.streak += 1;
    if self.streak < self.widen_after || self.current >= self.max {
      return false;
    }
    self.streak = 0;
    self.current = (self.current * self.factor).min(self.max);
    true
  }

  /// Returns true if the interval was narrowed.
  pub fn record_change(&mut self) -> bool {
    self.streak = 0;
    let narrowed = self.current != self.base;
    self.current = self.base;
    narrowed
  }

  pub fn record_failure(&mut self) {
    self.streak = 0;
  }
}
