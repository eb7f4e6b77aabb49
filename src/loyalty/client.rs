use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::api_types::{ApiAdjustPoints, ApiErrorBody, ApiRedeemCoupon, ApiVerifyResponse};
use super::types::{CouponInventory, MenuStatus, PointsBalance};
use crate::auth::{PinSource, TokenStore, TokenVerifier, VerifiedUser};
use crate::error::SyncError;

/// Connection settings for [`LoyaltyClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
  pub base_url: Url,
  pub timeout: Duration,
}

/// Loyalty API client wrapper
#[derive(Clone)]
pub struct LoyaltyClient {
  http: reqwest::Client,
  base_url: Url,
  timeout: Duration,
  tokens: Arc<TokenStore>,
}

impl LoyaltyClient {
  pub fn new(config: &ClientConfig, tokens: Arc<TokenStore>) -> Result<Self, SyncError> {
    let http = reqwest::Client::builder()
      .timeout(config.timeout)
      .build()
      .map_err(|e| SyncError::Network(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      http,
      base_url: config.base_url.clone(),
      timeout: config.timeout,
      tokens,
    })
  }

  pub fn tokens(&self) -> &Arc<TokenStore> {
    &self.tokens
  }

  /// Check `token` with the server and return the user it belongs to
  pub async fn verify_token(&self, token: &str) -> Result<VerifiedUser, SyncError> {
    let request = self
      .http
      .get(self.endpoint("auth/verify-token")?)
      .bearer_auth(token);
    let response: ApiVerifyResponse = self.send(request).await?;
    Ok(response.user)
  }

  /// Get a customer's points balance
  pub async fn points(&self, customer: &str) -> Result<PointsBalance, SyncError> {
    let path = format!("customers/{}/points", customer);
    self.authorized(Method::GET, &path).await
  }

  /// Get the remaining stock of a coupon
  pub async fn coupon_inventory(&self, coupon: &str) -> Result<CouponInventory, SyncError> {
    let path = format!("coupons/{}/inventory", coupon);
    self.authorized(Method::GET, &path).await
  }

  pub async fn menu_status(&self) -> Result<MenuStatus, SyncError> {
    self.authorized(Method::GET, "menu/status").await
  }

  /// Add `delta` (possibly negative) to a customer's balance
  pub async fn adjust_points(&self, customer: &str, delta: i64) -> Result<PointsBalance, SyncError> {
    let path = format!("customers/{}/points", customer);
    let request = self
      .request(Method::POST, &path)?
      .json(&ApiAdjustPoints { delta });
    self.send(request).await
  }

  /// Redeem one unit of `coupon` for `customer`
  pub async fn redeem_coupon(
    &self,
    coupon: &str,
    customer: &str,
  ) -> Result<CouponInventory, SyncError> {
    let path = format!("coupons/{}/redeem", coupon);
    let request = self
      .request(Method::POST, &path)?
      .json(&ApiRedeemCoupon {
        customer_id: customer,
      });
    self.send(request).await
  }

  async fn authorized<T: DeserializeOwned>(&self, method: Method, path: &str) -> Result<T, SyncError> {
    let request = self.request(method, path)?;
    self.send(request).await
  }

  /// A request carrying the session's bearer token
  fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, SyncError> {
    let token = self.tokens.get().ok_or(SyncError::MissingToken)?;
    Ok(
      self
        .http
        .request(method, self.endpoint(path)?)
        .bearer_auth(token),
    )
  }

  fn endpoint(&self, path: &str) -> Result<Url, SyncError> {
    // Url::join would drop a base path without a trailing slash
    let base = self.base_url.as_str().trim_end_matches('/');
    Url::parse(&format!("{}/{}", base, path))
      .map_err(|e| SyncError::Network(format!("invalid endpoint {}: {}", path, e)))
  }

  async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SyncError> {
    let response = request.send().await.map_err(|e| self.transport_error(e))?;
    let status = response.status();
    debug!(url = %response.url(), status = status.as_u16(), "loyalty api response");

    if status == StatusCode::UNAUTHORIZED {
      return Err(SyncError::AuthExpired);
    }

    let body = response.bytes().await.map_err(|e| self.transport_error(e))?;

    if !status.is_success() {
      let message = serde_json::from_slice::<ApiErrorBody>(&body)
        .map(|b| b.message)
        .unwrap_or_else(|_| {
          status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string()
        });
      return Err(SyncError::http(status.as_u16(), message));
    }

    Ok(serde_json::from_slice(&body)?)
  }

  fn transport_error(&self, error: reqwest::Error) -> SyncError {
    if error.is_timeout() {
      SyncError::Timeout(self.timeout)
    } else {
      SyncError::Network(error.to_string())
    }
  }
}

#[async_trait]
impl TokenVerifier for LoyaltyClient {
  async fn verify_token(&self, token: &str) -> Result<VerifiedUser, SyncError> {
    LoyaltyClient::verify_token(self, token).await
  }
}

#[async_trait]
impl PinSource for LoyaltyClient {
  /// The PIN comes from the verification endpoint, for the token's owner only.
  async fn expected_pin(&self, identity: &str) -> Result<Option<String>, SyncError> {
    let token = self.tokens.get().ok_or(SyncError::MissingToken)?;
    let user = LoyaltyClient::verify_token(self, &token).await?;

    match user.id.as_deref() {
      Some(id) if id != identity => {
        debug!(identity, "PIN requested for a different user");
        Ok(None)
      }
      _ => Ok(user.pincode),
    }
  }
}
