//! Cookie storage with `Max-Age` expiry.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

use crate::clock::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
  Strict,
  Lax,
  None,
}

impl fmt::Display for SameSite {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SameSite::Strict => write!(f, "Strict"),
      SameSite::Lax => write!(f, "Lax"),
      SameSite::None => write!(f, "None"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
  pub name: String,
  pub value: String,
  pub path: String,
  pub secure: bool,
  pub same_site: SameSite,
  pub max_age: Duration,
}

impl Cookie {
  /// Render as a `Set-Cookie` header value.
  pub fn to_set_cookie(&self) -> String {
    let mut header = format!(
      "{}={}; Path={}; Max-Age={}; SameSite={}",
      self.name,
      self.value,
      self.path,
      self.max_age.num_seconds(),
      self.same_site
    );
    if self.secure {
      header.push_str("; Secure");
    }
    header
  }
}

/// Where cookies live. Implementations enforce expiry themselves.
pub trait CookieStore: Send + Sync {
  /// The value of `name`, if present and not expired.
  fn get(&self, name: &str) -> Option<String>;

  /// Store `cookie`, replacing any cookie with the same name.
  fn set(&self, cookie: Cookie);

  fn remove(&self, name: &str);
}

struct StoredCookie {
  cookie: Cookie,
  expires_at: DateTime<Utc>,
}

/// In-memory cookie jar that honours `Max-Age` against a clock.
pub struct MemoryCookieJar {
  cookies: Mutex<HashMap<String, StoredCookie>>,
  clock: SharedClock,
}

impl MemoryCookieJar {
  pub fn new(clock: SharedClock) -> Self {
    Self {
      cookies: Mutex::new(HashMap::new()),
      clock,
    }
  }

  /// Full cookie record, for inspecting attributes.
  pub fn cookie(&self, name: &str) -> Option<Cookie> {
    let now = self.clock.now();
    let mut cookies = self.cookies.lock();
    Self::purge_expired(&mut cookies, name, now);
    cookies.get(name).map(|c| c.cookie.clone())
  }

  fn purge_expired(cookies: &mut HashMap<String, StoredCookie>, name: &str, now: DateTime<Utc>) {
    if cookies.get(name).is_some_and(|c| now >= c.expires_at) {
      cookies.remove(name);
    }
  }
}

impl CookieStore for MemoryCookieJar {
  fn get(&self, name: &str) -> Option<String> {
    let now = self.clock.now();
    let mut cookies = self.cookies.lock();
    Self::purge_expired(&mut cookies, name, now);
    cookies.get(name).map(|c| c.cookie.value.clone())
  }

  fn set(&self, cookie: Cookie) {
    let expires_at = self.clock.now() + cookie.max_age;
    self
      .cookies
      .lock()
      .insert(cookie.name.clone(), StoredCookie { cookie, expires_at });
  }

  fn remove(&self, name: &str) {
    self.cookies.lock().remove(name);
  }
}
