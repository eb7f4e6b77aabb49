//! Loyalty client that keeps every resource in a [`SyncEngine`].

use std::sync::Arc;

use super::client::LoyaltyClient;
use super::keys::ResourceKey;
use super::types::{CouponInventory, MenuStatus, PointsBalance};
use crate::auth::{Session, SessionBus};
use crate::cache::EvictionPolicy;
use crate::clock::SharedClock;
use crate::error::SyncError;
use crate::sync::{SyncConfig, SyncEngine, SyncOptions};

/// Loyalty client with transparent caching.
///
/// Exposes the same reads as [`LoyaltyClient`], each served through a
/// per-resource engine, plus optimistic versions of the mutations.
#[derive(Clone)]
pub struct SyncedLoyaltyClient {
  inner: LoyaltyClient,
  points: SyncEngine<PointsBalance>,
  coupons: SyncEngine<CouponInventory>,
  menu: SyncEngine<MenuStatus>,
}

impl SyncedLoyaltyClient {
  pub fn new(inner: LoyaltyClient, config: SyncConfig, clock: SharedClock, bus: SessionBus) -> Self {
    let points = SyncEngine::with_session_bus(
      with_policy(&config, EvictionPolicy::Lru),
      clock.clone(),
      bus.clone(),
    );
    let coupons = SyncEngine::with_session_bus(
      with_policy(&config, EvictionPolicy::Fifo),
      clock.clone(),
      bus.clone(),
    );
    let menu = SyncEngine::with_session_bus(with_policy(&config, EvictionPolicy::Fifo), clock, bus);

    Self {
      inner,
      points,
      coupons,
      menu,
    }
  }

  /// Have `session` clear every engine on logout or expiry.
  pub fn register_with(&self, session: &Session) {
    session.register(Arc::new(self.points.clone()));
    session.register(Arc::new(self.coupons.clone()));
    session.register(Arc::new(self.menu.clone()));
  }

  pub fn client(&self) -> &LoyaltyClient {
    &self.inner
  }

  pub fn points_engine(&self) -> &SyncEngine<PointsBalance> {
    &self.points
  }

  pub fn coupon_engine(&self) -> &SyncEngine<CouponInventory> {
    &self.coupons
  }

  pub fn menu_engine(&self) -> &SyncEngine<MenuStatus> {
    &self.menu
  }

  pub async fn points(&self, customer: &str, options: SyncOptions) -> Result<PointsBalance, SyncError> {
    let key = ResourceKey::points(customer).to_string();
    self
      .points
      .sync_now(&key, || self.inner.points(customer), options)
      .await
  }

  pub async fn coupon_inventory(
    &self,
    coupon: &str,
    options: SyncOptions,
  ) -> Result<CouponInventory, SyncError> {
    let key = ResourceKey::coupon(coupon).to_string();
    self
      .coupons
      .sync_now(&key, || self.inner.coupon_inventory(coupon), options)
      .await
  }

  pub async fn menu_status(&self, options: SyncOptions) -> Result<MenuStatus, SyncError> {
    let key = ResourceKey::Menu.to_string();
    self
      .menu
      .sync_now(&key, || self.inner.menu_status(), options)
      .await
  }

  /// Show the adjusted balance at once, then reconcile with the server.
  pub async fn adjust_points(&self, customer: &str, delta: i64) -> Result<PointsBalance, SyncError> {
    let key = ResourceKey::points(customer).to_string();
    self
      .points
      .mutate(
        &key,
        |current| adjusted_balance(current, customer, delta),
        || self.inner.adjust_points(customer, delta),
      )
      .await
  }

  /// Show one fewer coupon at once, then reconcile with the server.
  pub async fn redeem_coupon(&self, coupon: &str, customer: &str) -> Result<CouponInventory, SyncError> {
    let key = ResourceKey::coupon(coupon).to_string();
    self
      .coupons
      .mutate(
        &key,
        |current| redeemed_inventory(current, coupon),
        || self.inner.redeem_coupon(coupon, customer),
      )
      .await
  }

  /// Drop every cached balance, e.g. after a bulk import on the server.
  pub fn invalidate_points(&self) {
    self
      .points
      .invalidate_prefix(ResourceKey::points("").family());
  }

  pub fn dispose(&self) {
    self.points.dispose();
    self.coupons.dispose();
    self.menu.dispose();
  }
}

fn adjusted_balance(current: Option<&PointsBalance>, customer: &str, delta: i64) -> PointsBalance {
  match current {
    Some(balance) => PointsBalance {
      points: balance.points.saturating_add(delta),
      ..balance.clone()
    },
    None => PointsBalance {
      customer_id: customer.to_string(),
      points: delta,
      updated_at: None,
    },
  }
}

fn redeemed_inventory(current: Option<&CouponInventory>, coupon: &str) -> CouponInventory {
  match current {
    Some(inventory) => CouponInventory {
      remaining: inventory.remaining.saturating_sub(1).max(0),
      ..inventory.clone()
    },
    None => CouponInventory {
      coupon_id: coupon.to_string(),
      remaining: 0,
      total: None,
    },
  }
}

fn with_policy(config: &SyncConfig, policy: EvictionPolicy) -> SyncConfig {
  let mut config = config.clone();
  config.cache.policy = policy;
  config
}
