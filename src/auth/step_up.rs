//! Step-up credential: a short-lived PIN token gating sensitive actions.
//!
//! The expected PIN is fetched from the verification endpoint and compared
//! here, on the client. The server therefore discloses the PIN to whoever
//! holds a valid bearer token. The request/response shape is kept for
//! compatibility; moving the comparison server-side is the intended fix.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use super::cookie::{Cookie, CookieStore, SameSite};
use crate::actions::ActionSpec;
use crate::clock::SharedClock;
use crate::error::SyncError;

pub const STEP_UP_COOKIE: &str = "loyalty_step_up";

/// Constant-time PIN comparison.
fn pin_matches(entered: &str, expected: &str) -> bool {
  entered.as_bytes().ct_eq(expected.as_bytes()).into()
}
/// 12 hours
pub const STEP_UP_MAX_AGE_SECS: i64 = 43_200;
pub const MAX_PIN_ATTEMPTS: u32 = 3;

/// The issued step-up credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepUpToken {
  /// 32 random bytes as 64 lowercase hex characters
  pub value: String,
  pub issued_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

/// Looks up the PIN a user is expected to enter.
#[async_trait]
pub trait PinSource: Send + Sync {
  /// `Ok(None)` if the user has no PIN configured.
  async fn expected_pin(&self, identity: &str) -> Result<Option<String>, SyncError>;
}

/// Collects PINs from the user during a challenge.
#[async_trait]
pub trait PinPrompt: Send {
  /// The next PIN entered, or `None` if the user dismissed the challenge.
  async fn request_pin(&mut self, failed_attempts: u32) -> Option<String>;
}

/// Result of dispatching a gated action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch<R> {
  /// The action ran, exactly once
  Ran(R),
  /// The user dismissed the challenge; the action did not run
  Cancelled,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
  pub max_attempts: u32,
  pub token_max_age: Duration,
}

impl Default for GateConfig {
  fn default() -> Self {
    Self {
      max_attempts: MAX_PIN_ATTEMPTS,
      token_max_age: Duration::seconds(STEP_UP_MAX_AGE_SECS),
    }
  }
}

/// Issues, checks and revokes the step-up token.
pub struct CredentialGate {
  cookies: Arc<dyn CookieStore>,
  pins: Arc<dyn PinSource>,
  clock: SharedClock,
  config: GateConfig,
  /// Consecutive failures in the open challenge
  attempts: Mutex<u32>,
  issued: Mutex<Option<StepUpToken>>,
}

impl CredentialGate {
  pub fn new(
    cookies: Arc<dyn CookieStore>,
    pins: Arc<dyn PinSource>,
    clock: SharedClock,
    config: GateConfig,
  ) -> Self {
    Self {
      cookies,
      pins,
      clock,
      config,
      attempts: Mutex::new(0),
      issued: Mutex::new(None),
    }
  }

  /// Mint a new token, replacing any existing one.
  pub fn issue(&self) -> StepUpToken {
    let bytes: [u8; 32] = rand::random();
    let issued_at = self.clock.now();
    let token = StepUpToken {
      value: hex::encode(bytes),
      issued_at,
      expires_at: issued_at + self.config.token_max_age,
    };

    self.cookies.set(Cookie {
      name: STEP_UP_COOKIE.to_string(),
      value: token.value.clone(),
      path: "/".to_string(),
      secure: true,
      same_site: SameSite::Strict,
      max_age: self.config.token_max_age,
    });
    *self.issued.lock() = Some(token.clone());

    info!(expires_at = %token.expires_at, "step-up token issued");
    token
  }

  /// A token cookie is present. Expiry is the cookie store's job.
  pub fn has_valid(&self) -> bool {
    self.cookies.get(STEP_UP_COOKIE).is_some()
  }

  /// The live token, if the cookie still holds the one this gate issued.
  pub fn current(&self) -> Option<StepUpToken> {
    let value = self.cookies.get(STEP_UP_COOKIE)?;
    self
      .issued
      .lock()
      .as_ref()
      .filter(|token| token.value == value)
      .cloned()
  }

  pub fn revoke(&self) {
    self.cookies.remove(STEP_UP_COOKIE);
    *self.issued.lock() = None;
    debug!("step-up token revoked");
  }

  /// Start a fresh challenge session.
  pub fn open_challenge(&self) {
    *self.attempts.lock() = 0;
  }

  /// Consecutive failures in the current challenge.
  pub fn attempts(&self) -> u32 {
    *self.attempts.lock()
  }

  pub fn is_blocked(&self) -> bool {
    self.attempts() >= self.config.max_attempts
  }

  /// Check `pin` for `identity` and issue a token on a match.
  pub async fn verify(&self, pin: &str, identity: &str) -> Result<StepUpToken, SyncError> {
    if self.is_blocked() {
      return Err(SyncError::ChallengeBlocked);
    }

    let expected = self.pins.expected_pin(identity).await?;

    if expected.is_some_and(|expected| pin_matches(pin, &expected)) {
      *self.attempts.lock() = 0;
      return Ok(self.issue());
    }

    let attempts = {
      let mut attempts = self.attempts.lock();
      *attempts += 1;
      *attempts
    };
    let remaining = self.config.max_attempts.saturating_sub(attempts);
    warn!(attempts, remaining, "PIN verification failed");
    Err(SyncError::AttemptFailed {
      attempts,
      remaining,
    })
  }

  /// Run `action`, challenging for a PIN first if it needs step-up and no
  /// valid token exists. `run` is invoked at most once.
  pub async fn dispatch<F, Fut, R>(
    &self,
    action: &ActionSpec,
    identity: &str,
    prompt: &mut dyn PinPrompt,
    run: F,
  ) -> Result<Dispatch<R>, SyncError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = R>,
  {
    if !action.requires_step_up || self.has_valid() {
      return Ok(Dispatch::Ran(run().await));
    }

    debug!(action = %action.id, "step-up required, opening challenge");
    self.open_challenge();

    loop {
      let Some(pin) = prompt.request_pin(self.attempts()).await else {
        debug!(action = %action.id, "challenge dismissed");
        return Ok(Dispatch::Cancelled);
      };

      match self.verify(&pin, identity).await {
        Ok(_) => return Ok(Dispatch::Ran(run().await)),
        Err(SyncError::AttemptFailed { remaining: 0, .. }) => {
          return Err(SyncError::ChallengeBlocked);
        }
        Err(SyncError::AttemptFailed { .. }) => continue,
        Err(error) => return Err(error),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::auth::cookie::MemoryCookieJar;
  use crate::clock::ManualClock;
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct FixedPin(Option<&'static str>);

  #[async_trait]
  impl PinSource for FixedPin {
    async fn expected_pin(&self, _identity: &str) -> Result<Option<String>, SyncError> {
      Ok(self.0.map(String::from))
    }
  }

  struct ScriptedPrompt {
    pins: VecDeque<&'static str>,
    asked_with: Vec<u32>,
  }

  impl ScriptedPrompt {
    fn new(pins: &[&'static str]) -> Self {
      Self {
        pins: pins.iter().copied().collect(),
        asked_with: Vec::new(),
      }
    }
  }

  #[async_trait]
  impl PinPrompt for ScriptedPrompt {
    async fn request_pin(&mut self, failed_attempts: u32) -> Option<String> {
      self.asked_with.push(failed_attempts);
      self.pins.pop_front().map(String::from)
    }
  }

  fn gate(pin: Option<&'static str>) -> (CredentialGate, Arc<MemoryCookieJar>, ManualClock) {
    let clock = ManualClock::at_epoch();
    let jar = Arc::new(MemoryCookieJar::new(Arc::new(clock.clone())));
    let gate = CredentialGate::new(
      jar.clone(),
      Arc::new(FixedPin(pin)),
      Arc::new(clock.clone()),
      GateConfig::default(),
    );
    (gate, jar, clock)
  }

  fn gated_action() -> ActionSpec {
    ActionSpec::new("refund", "Refund").allow("admin").step_up()
  }

  #[test]
  fn test_step_up_lifecycle() {
    let (gate, _jar, clock) = gate(Some("1234"));
    assert!(!gate.has_valid());

    let token = gate.issue();
    assert!(gate.has_valid());
    assert_eq!(gate.current(), Some(token));

    gate.revoke();
    assert!(!gate.has_valid());

    gate.issue();
    clock.advance(Duration::seconds(STEP_UP_MAX_AGE_SECS - 1));
    assert!(gate.has_valid());
    clock.advance(Duration::seconds(1));
    assert!(!gate.has_valid());
    assert_eq!(gate.current(), None);
  }

  #[test]
  fn test_issued_token_shape_and_cookie_attributes() {
    let (gate, jar, _clock) = gate(None);
    let token = gate.issue();

    assert_eq!(token.value.len(), 64);
    assert!(token
      .value
      .chars()
      .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    assert_eq!(
      (token.expires_at - token.issued_at).num_seconds(),
      STEP_UP_MAX_AGE_SECS
    );

    let cookie = jar.cookie(STEP_UP_COOKIE).unwrap();
    assert!(cookie.secure);
    assert_eq!(cookie.same_site, SameSite::Strict);
    assert_eq!(cookie.max_age.num_seconds(), 43_200);
  }

  #[test]
  fn test_new_issue_replaces_previous_token() {
    let (gate, jar, _clock) = gate(None);
    let first = gate.issue();
    let second = gate.issue();

    assert_ne!(first.value, second.value);
    assert_eq!(jar.get(STEP_UP_COOKIE), Some(second.value.clone()));
    assert_eq!(gate.current(), Some(second));
  }

  #[tokio::test]
  async fn test_two_failures_then_success_issues_token() {
    let (gate, _jar, _clock) = gate(Some("1234"));
    gate.open_challenge();

    assert_eq!(
      gate.verify("0000", "staff-1").await.unwrap_err(),
      SyncError::AttemptFailed {
        attempts: 1,
        remaining: 2
      }
    );
    assert!(gate.verify("1111", "staff-1").await.is_err());
    assert_eq!(gate.attempts(), 2);

    let token = gate.verify("1234", "staff-1").await.unwrap();
    assert!(gate.has_valid());
    assert_eq!(gate.current(), Some(token));

    gate.open_challenge();
    assert_eq!(gate.attempts(), 0);
  }

  #[tokio::test]
  async fn test_three_failures_block_until_reopened() {
    let (gate, _jar, _clock) = gate(Some("1234"));
    gate.open_challenge();
    for _ in 0..3 {
      assert!(gate.verify("0000", "staff-1").await.is_err());
    }

    // Even the right PIN is refused now
    assert_eq!(
      gate.verify("1234", "staff-1").await.unwrap_err(),
      SyncError::ChallengeBlocked
    );
    assert!(!gate.has_valid());

    gate.open_challenge();
    assert!(gate.verify("1234", "staff-1").await.is_ok());
  }

  #[tokio::test]
  async fn test_user_without_pin_never_verifies() {
    let (gate, _jar, _clock) = gate(None);
    assert!(matches!(
      gate.verify("", "staff-1").await,
      Err(SyncError::AttemptFailed { .. })
    ));
  }

  #[test]
  fn test_pin_comparison_is_exact() {
    assert!(pin_matches("1234", "1234"));
    assert!(!pin_matches("123", "1234"));
    assert!(!pin_matches("12345", "1234"));
    assert!(!pin_matches("", "1234"));
    assert!(!pin_matches("1235", "1234"));
  }

  #[tokio::test]
  async fn test_prefix_of_pin_is_rejected() {
    let (gate, _jar, _clock) = gate(Some("1234"));
    assert_eq!(
      gate.verify("12", "staff-1").await.unwrap_err(),
      SyncError::AttemptFailed {
        attempts: 1,
        remaining: 2
      }
    );
    assert!(!gate.has_valid());
  }

  #[tokio::test]
  async fn test_dispatch_runs_ungated_action_directly() {
    let (gate, _jar, _clock) = gate(Some("1234"));
    let mut prompt = ScriptedPrompt::new(&[]);
    let action = ActionSpec::new("scan", "Scan").allow("all");

    let outcome = gate
      .dispatch(&action, "staff-1", &mut prompt, || async { 7 })
      .await
      .unwrap();

    assert_eq!(outcome, Dispatch::Ran(7));
    assert!(prompt.asked_with.is_empty());
  }

  #[tokio::test]
  async fn test_dispatch_with_valid_token_skips_challenge() {
    let (gate, _jar, _clock) = gate(Some("1234"));
    gate.issue();
    let mut prompt = ScriptedPrompt::new(&[]);

    let outcome = gate
      .dispatch(&gated_action(), "staff-1", &mut prompt, || async { "done" })
      .await
      .unwrap();

    assert_eq!(outcome, Dispatch::Ran("done"));
    assert!(prompt.asked_with.is_empty());
  }

  #[tokio::test]
  async fn test_dispatch_challenges_then_runs_once() {
    let (gate, _jar, _clock) = gate(Some("1234"));
    let mut prompt = ScriptedPrompt::new(&["9999", "8888", "1234"]);
    let runs = AtomicUsize::new(0);
    let counter = &runs;

    let outcome = gate
      .dispatch(&gated_action(), "staff-1", &mut prompt, move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
      })
      .await
      .unwrap();

    assert_eq!(outcome, Dispatch::Ran(()));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(prompt.asked_with, vec![0, 1, 2]);
    assert!(gate.has_valid());
  }

  #[tokio::test]
  async fn test_dispatch_blocks_after_three_failures() {
    let (gate, _jar, _clock) = gate(Some("1234"));
    let mut prompt = ScriptedPrompt::new(&["1", "2", "3", "1234"]);
    let runs = AtomicUsize::new(0);
    let counter = &runs;

    let err = gate
      .dispatch(&gated_action(), "staff-1", &mut prompt, move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
      })
      .await
      .unwrap_err();

    assert_eq!(err, SyncError::ChallengeBlocked);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(prompt.asked_with.len(), 3);
  }

  #[tokio::test]
  async fn test_dispatch_cancelled_challenge_does_not_run() {
    let (gate, _jar, _clock) = gate(Some("1234"));
    let mut prompt = ScriptedPrompt::new(&["0000"]);

    let outcome = gate
      .dispatch(&gated_action(), "staff-1", &mut prompt, || async { 1 })
      .await
      .unwrap();

    assert_eq!(outcome, Dispatch::Cancelled);
    assert!(!gate.has_valid());
  }
}
