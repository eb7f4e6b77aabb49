//! Error taxonomy for sync, mutation and step-up operations.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the sync engine and the auth components.
///
/// The type is `Clone` so every caller collapsed onto one in-flight request
/// observes the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
  /// The request never produced a response (connection refused, DNS, reset).
  #[error("network error: {0}")]
  Network(String),

  /// The request exceeded its deadline and was abandoned.
  #[error("request timed out after {}ms", .0.as_millis())]
  Timeout(Duration),

  /// The server answered with a non-2xx status.
  #[error("server returned {status}: {message}")]
  Http { status: u16, message: String },

  /// The bearer token is no longer accepted, or has expired locally.
  #[error("authentication expired")]
  AuthExpired,

  /// An optimistic confirmation lost to a newer cached value.
  #[error("stale write discarded: a newer value is already cached")]
  StaleWriteConflict,

  /// The supplied PIN did not match.
  #[error("PIN mismatch ({attempts} failed, {remaining} remaining)")]
  AttemptFailed { attempts: u32, remaining: u32 },

  /// Too many consecutive PIN failures in this challenge session.
  #[error("too many failed attempts; reopen the challenge to retry")]
  ChallengeBlocked,

  /// A response body or token could not be decoded.
  #[error("decode error: {0}")]
  Decode(String),

  /// No bearer token is held locally.
  #[error("no bearer token available")]
  MissingToken,

  /// An identical mutation is already in flight for this resource.
  #[error("an identical request is already in flight")]
  InFlight,

  /// The owning engine was disposed before the result arrived.
  #[error("engine disposed")]
  Disposed,
}

impl SyncError {
  /// Whether this error must tear down the local session.
  pub fn is_auth_expired(&self) -> bool {
    matches!(self, SyncError::AuthExpired)
  }

  pub fn http(status: u16, message: impl Into<String>) -> Self {
    SyncError::Http {
      status,
      message: message.into(),
    }
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    SyncError::Decode(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_timeout_is_distinct_from_http() {
    let timeout = SyncError::Timeout(Duration::from_secs(10));
    let http = SyncError::http(504, "gateway timeout");

    assert_ne!(timeout, http);
    assert_eq!(timeout.to_string(), "request timed out after 10000ms");
    assert!(http.to_string().contains("504"));
  }

  #[test]
  fn test_only_auth_expired_is_fatal() {
    assert!(SyncError::AuthExpired.is_auth_expired());
    assert!(!SyncError::http(401, "nope").is_auth_expired());
    assert!(!SyncError::Network("reset".into()).is_auth_expired());
  }
}
