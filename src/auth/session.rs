//! Session ownership and teardown.
//!
//! Any component that sees the server reject the bearer token publishes
//! [`SessionEvent::AuthExpired`] on the [`SessionBus`]. The [`Session`] reacts
//! by clearing every token and cache it knows about and announcing
//! [`SessionEvent::LoginRequired`], which the host turns into a redirect.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::role::RoleResolver;
use super::step_up::CredentialGate;
use super::token::{TokenClaims, TokenStore};
use crate::clock::SharedClock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
  /// The server rejected the bearer token, or it expired locally
  AuthExpired,
  /// The user logged out explicitly
  LoggedOut,
  /// Local credentials are gone; send the user to the login entry point
  LoginRequired,
}

/// Broadcast channel for session-wide events. Clones share the channel.
#[derive(Clone)]
pub struct SessionBus {
  tx: broadcast::Sender<SessionEvent>,
}

impl SessionBus {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(16);
    Self { tx }
  }

  pub fn publish(&self, event: SessionEvent) {
    // Nobody listening is fine
    let _ = self.tx.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
    self.tx.subscribe()
  }
}

impl Default for SessionBus {
  fn default() -> Self {
    Self::new()
  }
}

/// State that must not outlive the user's session.
pub trait SessionScoped: Send + Sync {
  fn clear_session_data(&self);
}

/// Owns the credentials of one signed-in user.
pub struct Session {
  tokens: Arc<TokenStore>,
  gate: Arc<CredentialGate>,
  roles: Arc<RoleResolver>,
  bus: SessionBus,
  clock: SharedClock,
  scoped: Mutex<Vec<Arc<dyn SessionScoped>>>,
}

impl Session {
  pub fn new(
    tokens: Arc<TokenStore>,
    gate: Arc<CredentialGate>,
    roles: Arc<RoleResolver>,
    bus: SessionBus,
    clock: SharedClock,
  ) -> Self {
    Self {
      tokens,
      gate,
      roles,
      bus,
      clock,
      scoped: Mutex::new(Vec::new()),
    }
  }

  pub fn tokens(&self) -> &Arc<TokenStore> {
    &self.tokens
  }

  pub fn gate(&self) -> &Arc<CredentialGate> {
    &self.gate
  }

  pub fn roles(&self) -> &Arc<RoleResolver> {
    &self.roles
  }

  pub fn bus(&self) -> &SessionBus {
    &self.bus
  }

  /// Clear `scoped` whenever the session ends.
  pub fn register(&self, scoped: Arc<dyn SessionScoped>) {
    self.scoped.lock().push(scoped);
  }

  pub fn logout(&self) {
    info!("logging out");
    self.teardown();
    self.bus.publish(SessionEvent::LoggedOut);
    self.bus.publish(SessionEvent::LoginRequired);
  }

  /// Treat the session as expired: clear everything and ask for a login.
  pub fn expire(&self) {
    warn!("session expired, clearing local credentials");
    self.teardown();
    self.bus.publish(SessionEvent::LoginRequired);
  }

  /// Detect a bearer token whose `exp` has passed without asking the server.
  ///
  /// Returns true and publishes `AuthExpired` if so.
  pub fn check_local_expiry(&self) -> bool {
    let Some(token) = self.tokens.get() else {
      return false;
    };
    let expired = TokenClaims::decode(&token)
      .map(|claims| claims.is_expired(self.clock.now()))
      .unwrap_or(true);
    if expired {
      self.bus.publish(SessionEvent::AuthExpired);
    }
    expired
  }

  /// React to `AuthExpired` events until the session is dropped.
  pub fn spawn_expiry_watch(self: &Arc<Self>) -> JoinHandle<()> {
    let mut events = self.bus.subscribe();
    let session: Weak<Self> = Arc::downgrade(self);

    tokio::spawn(async move {
      loop {
        match events.recv().await {
          Ok(SessionEvent::AuthExpired) => {
            let Some(session) = session.upgrade() else {
              break;
            };
            session.expire();
          }
          Ok(_) => {}
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "session watcher lagged");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    })
  }

  fn teardown(&self) {
    self.tokens.clear();
    self.gate.revoke();
    self.roles.clear();
    for scoped in self.scoped.lock().iter() {
      scoped.clear_session_data();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::auth::cookie::MemoryCookieJar;
  use crate::auth::role::{TokenVerifier, VerifiedUser};
  use crate::auth::step_up::{GateConfig, PinSource};
  use crate::auth::token::tests::token_with;
  use crate::clock::ManualClock;
  use crate::error::SyncError;
  use crate::sync::{SyncConfig, SyncEngine, SyncOptions};
  use async_trait::async_trait;
  use chrono::Duration;
  use serde_json::json;
  use std::time::Duration as StdDuration;

  struct Offline;

  #[async_trait]
  impl TokenVerifier for Offline {
    async fn verify_token(&self, _token: &str) -> Result<VerifiedUser, SyncError> {
      Err(SyncError::Network("offline".into()))
    }
  }

  #[async_trait]
  impl PinSource for Offline {
    async fn expected_pin(&self, _identity: &str) -> Result<Option<String>, SyncError> {
      Ok(None)
    }
  }

  fn session(token: &str) -> (Arc<Session>, ManualClock) {
    let clock = ManualClock::at_epoch();
    let shared: SharedClock = Arc::new(clock.clone());
    let bus = SessionBus::new();
    let tokens = Arc::new(TokenStore::with_token(token));
    let gate = Arc::new(CredentialGate::new(
      Arc::new(MemoryCookieJar::new(shared.clone())),
      Arc::new(Offline),
      shared.clone(),
      GateConfig::default(),
    ));
    let roles = Arc::new(
      RoleResolver::new(tokens.clone(), Arc::new(Offline), shared.clone(), Duration::minutes(5))
        .with_session_bus(bus.clone()),
    );
    (
      Arc::new(Session::new(tokens, gate, roles, bus, shared)),
      clock,
    )
  }

  #[tokio::test]
  async fn test_logout_clears_everything() {
    let (session, _clock) = session(&token_with(json!({"role": "admin", "exp": 3600})));
    let engine: SyncEngine<serde_json::Value> =
      SyncEngine::new(SyncConfig::default(), crate::clock::system());
    session.register(Arc::new(engine.clone()));
    engine
      .sync_now("menu", || async { Ok(json!({"open": true})) }, SyncOptions::foreground())
      .await
      .unwrap();
    session.gate().issue();
    session.roles().get_role_fast();
    let mut events = session.bus().subscribe();

    session.logout();

    assert!(!session.tokens().is_present());
    assert!(!session.gate().has_valid());
    assert!(session.roles().cached_claim().is_none());
    assert_eq!(engine.cached("menu"), None);
    assert_eq!(events.try_recv().unwrap(), SessionEvent::LoggedOut);
    assert_eq!(events.try_recv().unwrap(), SessionEvent::LoginRequired);
  }

  #[tokio::test]
  async fn test_auth_expired_event_triggers_teardown() {
    let (session, _clock) = session(&token_with(json!({"role": "admin", "exp": 3600})));
    session.gate().issue();
    let mut events = session.bus().subscribe();
    let watcher = session.spawn_expiry_watch();

    session.bus().publish(SessionEvent::AuthExpired);

    let next = tokio::time::timeout(StdDuration::from_secs(1), async {
      loop {
        if let Ok(SessionEvent::LoginRequired) = events.recv().await {
          break;
        }
      }
    })
    .await;
    assert!(next.is_ok());
    assert!(!session.tokens().is_present());
    assert!(!session.gate().has_valid());
    watcher.abort();
  }

  #[test]
  fn test_local_expiry_detection() {
    let (session, clock) = session(&token_with(json!({"exp": 60})));
    let mut events = session.bus().subscribe();
    assert!(!session.check_local_expiry());

    clock.advance(Duration::seconds(60));
    assert!(session.check_local_expiry());
    assert_eq!(events.try_recv().unwrap(), SessionEvent::AuthExpired);
  }
}
