//! Role resolution for action visibility.
//!
//! [`RoleResolver::get_role_fast`] never waits on the network: it reads a
//! short-lived cache, then falls back to the locally held bearer token. The
//! authoritative role only arrives through
//! [`RoleResolver::refresh_in_background`], which overwrites the cache.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::session::{SessionBus, SessionEvent};
use super::token::{TokenClaims, TokenStore};
use crate::actions::ActionSpec;
use crate::cache::{CacheConfig, EvictionPolicy, TtlCache};
use crate::clock::SharedClock;
use crate::error::SyncError;

const ROLE_CACHE_KEY: &str = "role";

/// A user's role, normalised to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Role(String);

impl Role {
  pub const DEFAULT: &'static str = "user";

  pub fn new(role: &str) -> Self {
    Self(role.trim().to_lowercase())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// `admin` and `administrator` are the same role.
  pub fn is_admin(&self) -> bool {
    matches!(self.0.as_str(), "admin" | "administrator")
  }
}

impl Default for Role {
  fn default() -> Self {
    Self(Self::DEFAULT.to_string())
  }
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Free-function form of [`Role::is_admin`] for raw strings.
pub fn is_admin(role: &str) -> bool {
  Role::new(role).is_admin()
}

/// Cached role with the moment it stops being trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleClaim {
  pub role: Role,
  pub expires_at: DateTime<Utc>,
}

/// User record returned by the token verification endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VerifiedUser {
  #[serde(default)]
  pub id: Option<String>,
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub role: Option<String>,
  #[serde(default)]
  pub pincode: Option<String>,
}

/// Server-side check of a bearer token.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
  /// `Err(AuthExpired)` when the server rejects the token.
  async fn verify_token(&self, token: &str) -> Result<VerifiedUser, SyncError>;
}

/// Resolves the current user's role without blocking on the network.
pub struct RoleResolver {
  tokens: Arc<TokenStore>,
  verifier: Arc<dyn TokenVerifier>,
  cache: Mutex<TtlCache<RoleClaim>>,
  bus: Option<SessionBus>,
  clock: SharedClock,
  ttl: Duration,
}

impl RoleResolver {
  pub fn new(
    tokens: Arc<TokenStore>,
    verifier: Arc<dyn TokenVerifier>,
    clock: SharedClock,
    ttl: Duration,
  ) -> Self {
    let config = CacheConfig {
      capacity: 1,
      policy: EvictionPolicy::Fifo,
      default_ttl: ttl,
    };
    Self {
      tokens,
      verifier,
      cache: Mutex::new(TtlCache::new(config, clock.clone())),
      bus: None,
      clock,
      ttl,
    }
  }

  /// Publish `AuthExpired` on `bus` when the server rejects the token.
  pub fn with_session_bus(mut self, bus: SessionBus) -> Self {
    self.bus = Some(bus);
    self
  }

  /// The best role known right now. Never touches the network.
  pub fn get_role_fast(&self) -> Role {
    let cached = self.cache.lock().get_fresh(ROLE_CACHE_KEY);
    if let Some(claim) = cached {
      return claim.role;
    }

    let role = self.role_from_token();
    self.store(role.clone());
    role
  }

  /// Ask the server for the authoritative role and cache it.
  ///
  /// Falls back to the token-derived role on any failure. A rejected token
  /// additionally drops the cached role and publishes `AuthExpired`.
  pub async fn refresh_in_background(&self) -> Role {
    let Some(token) = self.tokens.get() else {
      return self.get_role_fast();
    };

    match self.verifier.verify_token(&token).await {
      Ok(user) => {
        let role = user.role.as_deref().map(Role::new).unwrap_or_default();
        debug!(%role, "role reconciled with server");
        self.store(role.clone());
        role
      }
      Err(SyncError::AuthExpired) => {
        warn!("token rejected during role refresh");
        self.clear();
        if let Some(bus) = &self.bus {
          bus.publish(SessionEvent::AuthExpired);
        }
        self.role_from_token()
      }
      Err(error) => {
        warn!(%error, "role refresh failed, keeping token-derived role");
        self.get_role_fast()
      }
    }
  }

  /// Run `refresh_in_background` on its own task.
  pub fn spawn_refresh(self: &Arc<Self>) -> JoinHandle<Role> {
    let resolver = Arc::clone(self);
    tokio::spawn(async move { resolver.refresh_in_background().await })
  }

  /// Whether `action` should be offered to the current user.
  pub fn is_visible(&self, action: &ActionSpec) -> bool {
    action.is_visible_to(&self.get_role_fast())
  }

  pub fn visible_actions<'a>(&self, actions: &'a [ActionSpec]) -> Vec<&'a ActionSpec> {
    let role = self.get_role_fast();
    actions.iter().filter(|a| a.is_visible_to(&role)).collect()
  }

  pub fn cached_claim(&self) -> Option<RoleClaim> {
    self.cache.lock().peek(ROLE_CACHE_KEY).map(|e| e.value)
  }

  pub fn clear(&self) {
    self.cache.lock().clear();
  }

  fn role_from_token(&self) -> Role {
    let Some(token) = self.tokens.get() else {
      return Role::default();
    };

    match TokenClaims::decode(&token) {
      Ok(claims) if claims.is_expired(self.clock.now()) => {
        debug!("bearer token expired, using default role");
        Role::default()
      }
      Ok(claims) => claims.role().map(Role::new).unwrap_or_default(),
      Err(error) => {
        debug!(%error, "bearer token unreadable, using default role");
        Role::default()
      }
    }
  }

  fn store(&self, role: Role) {
    let claim = RoleClaim {
      role,
      expires_at: self.clock.now() + self.ttl,
    };
    self.cache.lock().set(ROLE_CACHE_KEY, claim);
  }
}
