//! Serde types matching the loyalty API's wire format.
//!
//! Kept apart from the domain types so request and envelope shapes do not
//! leak into the rest of the crate.

use serde::{Deserialize, Serialize};

use crate::auth::VerifiedUser;

/// `GET /auth/verify-token` response
#[derive(Debug, Deserialize)]
pub struct ApiVerifyResponse {
  pub user: VerifiedUser,
}

/// Error body the API sends with non-2xx statuses
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
  pub message: String,
}

/// `POST /customers/{id}/points` body
#[derive(Debug, Serialize)]
pub struct ApiAdjustPoints {
  pub delta: i64,
}

/// `POST /coupons/{id}/redeem` body
#[derive(Debug, Serialize)]
pub struct ApiRedeemCoupon<'a> {
  pub customer_id: &'a str,
}
