//! Domain types for the loyalty resources kept in sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Syncable;

/// A customer's loyalty points balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsBalance {
  pub customer_id: String,
  pub points: i64,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

/// Remaining stock of one coupon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponInventory {
  pub coupon_id: String,
  pub remaining: i64,
  #[serde(default)]
  pub total: Option<i64>,
}

/// Whether the menu is orderable and how many items are available
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuStatus {
  pub open: bool,
  #[serde(default)]
  pub available_items: i64,
}

impl Syncable for PointsBalance {
  fn tracked_count(&self) -> Option<i64> {
    Some(self.points)
  }
}

impl Syncable for CouponInventory {
  fn tracked_count(&self) -> Option<i64> {
    Some(self.remaining)
  }
}

impl Syncable for MenuStatus {
  fn tracked_count(&self) -> Option<i64> {
    Some(self.available_items)
  }
}
