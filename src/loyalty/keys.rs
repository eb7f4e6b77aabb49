//! Cache keys for loyalty resources.

use std::fmt;

/// One cached loyalty resource.
///
/// The rendered form (`points:42`) is both the cache key and the dedup
/// resource, so prefix invalidation works per resource family.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKey {
  /// Points balance of a customer
  Points { customer: String },
  /// Inventory of a coupon
  Coupon { coupon: String },
  /// Menu availability
  Menu,
}

impl ResourceKey {
  pub fn points(customer: impl Into<String>) -> Self {
    Self::Points {
      customer: normalize_id(&customer.into()),
    }
  }

  pub fn coupon(coupon: impl Into<String>) -> Self {
    Self::Coupon {
      coupon: normalize_id(&coupon.into()),
    }
  }

  /// Prefix shared by every key of this resource family.
  pub fn family(&self) -> &'static str {
    match self {
      Self::Points { .. } => "points:",
      Self::Coupon { .. } => "coupon:",
      Self::Menu => "menu",
    }
  }

  pub fn description(&self) -> String {
    match self {
      Self::Points { customer } => format!("points for customer {}", customer),
      Self::Coupon { coupon } => format!("inventory of coupon {}", coupon),
      Self::Menu => "menu status".to_string(),
    }
  }
}

impl fmt::Display for ResourceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Points { customer } => write!(f, "points:{}", customer),
      Self::Coupon { coupon } => write!(f, "coupon:{}", coupon),
      Self::Menu => write!(f, "menu"),
    }
  }
}

/// Trim identifiers so ` 42` and `42` share a cache slot.
fn normalize_id(id: &str) -> String {
  id.trim().to_string()
}
