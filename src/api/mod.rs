pub mod coinbase;
pub mod signature;

pub use coinbase::CoinbaseGateway;
pub use signature::RequestSigner;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{MarketStats, OrderAck, OrderFill, OrderRequest};
use crate::Result;

/// Exchange operations the engine depends on
///
/// Implementations sign every request and share one rate limiter; all
/// calls may fail and none should block longer than its own timeout.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Place a market order tagged with its correlation id
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck>;

    /// Execution report for a previously submitted order
    async fn order_status(&self, correlation_id: Uuid) -> Result<OrderFill>;

    /// 24h open/high/low for an asset
    async fn market_stats(&self, asset_id: &str) -> Result<MarketStats>;
}
