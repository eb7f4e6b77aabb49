use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::auth::SessionEvent;
use crate::error::SyncError;
use crate::sync::ChangeEvent;

/// What one poll cycle observed
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
  /// Served from cache without asking the server
  Cached,
  Unchanged,
  Changed,
  Failed(SyncError),
}

/// Application events
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
  /// A poll cycle finished
  Polled(PollOutcome),
  /// A tracked counter moved
  Changed(ChangeEvent),
  /// Session lifecycle
  Session(SessionEvent),
}

/// Funnels poller results, change notifications and session events into one
/// stream
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Forward every change event from an engine
  pub fn forward_changes(&self, changes: broadcast::Receiver<ChangeEvent>) {
    forward(changes, self.tx.clone(), Event::Changed);
  }

  /// Forward every session event
  pub fn forward_session(&self, events: broadcast::Receiver<SessionEvent>) {
    forward(events, self.tx.clone(), Event::Session);
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}

fn forward<T, F>(mut rx: broadcast::Receiver<T>, tx: mpsc::UnboundedSender<Event>, wrap: F)
where
  T: Clone + Send + 'static,
  F: Fn(T) -> Event + Send + 'static,
{
  tokio::spawn(async move {
    loop {
      match rx.recv().await {
        Ok(item) => {
          if tx.send(wrap(item)).is_err() {
            break;
          }
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "event forwarder lagged");
        }
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  });
}
