//! Bearer token storage and client-side payload decoding.
//!
//! Only the payload segment is read. The signature is never checked here, so
//! anything derived from these claims is a display hint and must be
//! re-validated by the server before it grants anything.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Holds the bearer token for the current session.
#[derive(Default)]
pub struct TokenStore {
  token: Mutex<Option<String>>,
}

impl TokenStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_token(token: impl Into<String>) -> Self {
    Self {
      token: Mutex::new(Some(token.into())),
    }
  }

  pub fn set(&self, token: impl Into<String>) {
    *self.token.lock() = Some(token.into());
  }

  pub fn get(&self) -> Option<String> {
    self.token.lock().clone()
  }

  pub fn clear(&self) {
    *self.token.lock() = None;
  }

  pub fn is_present(&self) -> bool {
    self.token.lock().is_some()
  }
}

/// Field names that may carry the role, in lookup order.
const ROLE_FIELDS: &[&str] = &["role", "userRole", "user_role"];

/// Decoded payload of a bearer token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenClaims {
  payload: Map<String, Value>,
}

impl TokenClaims {
  /// Decode the middle segment of a `header.payload.signature` token.
  pub fn decode(token: &str) -> Result<Self, SyncError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
      (Some(_), Some(payload), Some(_)) => payload,
      _ => return Err(SyncError::Decode("token is not three segments".into())),
    };

    // Tolerate padded encoders
    let bytes = URL_SAFE_NO_PAD
      .decode(payload.trim_end_matches('='))
      .map_err(|e| SyncError::Decode(format!("token payload is not base64url: {}", e)))?;

    match serde_json::from_slice(&bytes)? {
      Value::Object(payload) => Ok(Self { payload }),
      _ => Err(SyncError::Decode("token payload is not an object".into())),
    }
  }

  /// The `exp` claim, in seconds since the epoch.
  pub fn exp(&self) -> Option<i64> {
    match self.payload.get("exp")? {
      Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
      _ => None,
    }
  }

  /// Expired, or carrying no usable `exp` at all.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.exp().map_or(true, |exp| exp <= now.timestamp())
  }

  /// First role found along the fallback chain.
  pub fn role(&self) -> Option<&str> {
    ROLE_FIELDS
      .iter()
      .find_map(|field| self.payload.get(*field).and_then(Value::as_str))
      .or_else(|| {
        self
          .payload
          .get("user")
          .and_then(|user| user.get("role"))
          .and_then(Value::as_str)
      })
      .or_else(|| {
        self
          .payload
          .get("roles")
          .and_then(Value::as_array)
          .and_then(|roles| roles.first())
          .and_then(Value::as_str)
      })
  }

  pub fn get(&self, claim: &str) -> Option<&Value> {
    self.payload.get(claim)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use serde_json::json;

  /// Build an unsigned token around `payload`.
  pub(crate) fn token_with(payload: Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.signature", header, body)
  }

  #[test]
  fn test_decode_reads_payload_only() {
    let claims = TokenClaims::decode(&token_with(json!({"role": "admin", "exp": 10}))).unwrap();
    assert_eq!(claims.role(), Some("admin"));
    assert_eq!(claims.exp(), Some(10));
  }

  #[test]
  fn test_decode_rejects_malformed_tokens() {
    assert!(TokenClaims::decode("not-a-token").is_err());
    assert!(TokenClaims::decode("a.!!!.c").is_err());
    let array = format!("h.{}.s", URL_SAFE_NO_PAD.encode("[1,2]"));
    assert!(TokenClaims::decode(&array).is_err());
  }

  #[test]
  fn test_role_fallback_chain() {
    let cases = [
      (json!({"userRole": "staff"}), Some("staff")),
      (json!({"user_role": "manager"}), Some("manager")),
      (json!({"user": {"role": "cashier"}}), Some("cashier")),
      (json!({"roles": ["admin", "staff"]}), Some("admin")),
      (json!({"role": "admin", "userRole": "staff"}), Some("admin")),
      (json!({"sub": "42"}), None),
    ];

    for (payload, expected) in cases {
      let claims = TokenClaims::decode(&token_with(payload.clone())).unwrap();
      assert_eq!(claims.role(), expected, "payload {}", payload);
    }
  }

  #[test]
  fn test_missing_exp_counts_as_expired() {
    let now = DateTime::<Utc>::UNIX_EPOCH;
    let claims = TokenClaims::decode(&token_with(json!({"role": "admin"}))).unwrap();
    assert!(claims.is_expired(now));

    let claims = TokenClaims::decode(&token_with(json!({"exp": 1}))).unwrap();
    assert!(!claims.is_expired(now));
  }

  #[test]
  fn test_token_store_lifecycle() {
    let store = TokenStore::new();
    assert!(!store.is_present());
    store.set("abc");
    assert_eq!(store.get().as_deref(), Some("abc"));
    store.clear();
    assert_eq!(store.get(), None);
  }
}
