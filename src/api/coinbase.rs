use async_trait::async_trait;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{ExchangeGateway, RequestSigner};
use crate::config::Credentials;
use crate::models::{MarketStats, OrderAck, OrderFill, OrderRequest, OrderSide};
use crate::{Error, Result};

const CB_ACCESS_KEY: &str = "CB-ACCESS-KEY";
const CB_ACCESS_SIGN: &str = "CB-ACCESS-SIGN";
const CB_ACCESS_TIMESTAMP: &str = "CB-ACCESS-TIMESTAMP";
const CB_ACCESS_PASSPHRASE: &str = "CB-ACCESS-PASSPHRASE";

const ORDERS_PATH: &str = "/orders";

// Type alias for the rate limiter to simplify signatures
type GatewayRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Serialize)]
struct PlaceOrderBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    client_oid: Uuid,
    product_id: &'a str,
    side: OrderSide,
    #[serde(skip_serializing_if = "Option::is_none")]
    funds: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(default)]
    settled: bool,
    executed_value: Option<String>,
    filled_size: Option<String>,
    fill_fees: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    open: String,
    high: String,
    low: String,
}

fn parse_amount(value: Option<&str>, what: &str) -> Result<f64> {
    match value {
        None | Some("") => Ok(0.0),
        Some(raw) => raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| Error::TransientParse(format!("{} '{}'", what, raw))),
    }
}

/// REST gateway for a Coinbase-style exchange
///
/// Cloneable; all clones share the same rate limiter.
#[derive(Clone)]
pub struct CoinbaseGateway {
    client: Client,
    base_url: String,
    key: String,
    passphrase: String,
    signer: RequestSigner,
    rate_limiter: Arc<GatewayRateLimiter>,
    timeout: Duration,
}

impl CoinbaseGateway {
    /// # Arguments
    /// * `base_url` - REST root, e.g. "https://api.exchange.coinbase.com"
    /// * `requests_per_sec` - Token bucket refill rate shared by every call
    /// * `timeout` - Upper bound for one call, including the wait for a token
    pub fn new(
        base_url: impl Into<String>,
        credentials: &Credentials,
        requests_per_sec: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let signer = RequestSigner::new(&credentials.secret)?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        let rate = NonZeroU32::new(requests_per_sec)
            .ok_or_else(|| Error::Configuration("rate limit must be positive".to_string()))?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rate)));

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key: credentials.key.clone(),
            passphrase: credentials.passphrase.clone(),
            signer,
            rate_limiter,
            timeout,
        })
    }

    /// Signed, rate-limited request; non-2xx responses become errors
    async fn send(&self, method: Method, path: &str, body: Option<String>) -> Result<reqwest::Response> {
        // Queue for a token, but never past our own timeout
        tokio::time::timeout(self.timeout, self.rate_limiter.until_ready())
            .await
            .map_err(|_| Error::RateLimited)?;

        let timestamp = Utc::now().timestamp().to_string();
        let body = body.unwrap_or_default();
        let signature = self.signer.sign(&timestamp, method.as_str(), path, &body)?;

        let mut request = self
            .client
            .request(method.clone(), format!("{}{}", self.base_url, path))
            .header(CB_ACCESS_KEY, &self.key)
            .header(CB_ACCESS_SIGN, signature)
            .header(CB_ACCESS_TIMESTAMP, &timestamp)
            .header(CB_ACCESS_PASSPHRASE, &self.passphrase)
            .header(reqwest::header::ACCEPT, "application/json");

        if !body.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout("exchange request")
            } else {
                Error::Http(e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status.as_u16() == 429 {
            tracing::warn!("Rate limited by exchange (429) on {} {}", method, path);
            return Err(Error::RateLimited);
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(Error::Gateway(format!(
            "{} {} failed ({}): {}",
            method, path, status, error_text
        )))
    }
}

#[async_trait]
impl ExchangeGateway for CoinbaseGateway {
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        let body = PlaceOrderBody {
            kind: "market",
            client_oid: order.correlation_id,
            product_id: &order.asset_id,
            side: order.side,
            funds: order.funds.map(|f| f.to_string()),
            size: order.size.map(|s| s.to_string()),
        };
        let body = serde_json::to_string(&body)?;

        tracing::info!("Sending order request: {}", body);
        self.send(Method::POST, ORDERS_PATH, Some(body)).await?;

        Ok(OrderAck {
            correlation_id: order.correlation_id,
        })
    }

    async fn order_status(&self, correlation_id: Uuid) -> Result<OrderFill> {
        let path = format!("{}/client:{}", ORDERS_PATH, correlation_id);
        let response: OrderResponse = self
            .send(Method::GET, &path, None)
            .await?
            .json()
            .await
            .map_err(|e| Error::TransientParse(format!("order status: {}", e)))?;

        Ok(OrderFill {
            settled: response.settled,
            executed_value: parse_amount(response.executed_value.as_deref(), "executed_value")?,
            filled_size: parse_amount(response.filled_size.as_deref(), "filled_size")?,
            fees: parse_amount(response.fill_fees.as_deref(), "fill_fees")?,
        })
    }

    async fn market_stats(&self, asset_id: &str) -> Result<MarketStats> {
        let path = format!("/products/{}/stats", asset_id);
        let response: StatsResponse = self
            .send(Method::GET, &path, None)
            .await?
            .json()
            .await
            .map_err(|e| Error::TransientParse(format!("stats for {}: {}", asset_id, e)))?;

        let field = |raw: &str, name: &str| {
            raw.parse::<f64>()
                .map_err(|_| Error::TransientParse(format!("{} '{}' for {}", name, raw, asset_id)))
        };

        Ok(MarketStats {
            open: field(&response.open, "open")?,
            high: field(&response.high, "high")?,
            low: field(&response.low, "low")?,
        })
    }
}
