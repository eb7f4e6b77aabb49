//! Loyalty API access, plain and cached.

pub mod api_types;
pub mod client;
pub mod keys;
pub mod synced_client;
pub mod types;

pub use client::{ClientConfig, LoyaltyClient};
pub use keys::ResourceKey;
pub use synced_client::SyncedLoyaltyClient;
pub use types::{CouponInventory, MenuStatus, PointsBalance};
