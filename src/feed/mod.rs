// Live price feed: latest prices, subscriptions and bucketed aggregation
pub mod aggregator;
pub mod ticker;

pub use aggregator::{FeedAggregator, PriceSegment, PriceWindow};
pub use ticker::TickerConnection;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Latest observation for one asset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceEntry {
    pub price: f64,
    pub previous: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// Subscription change requested of the ticker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// Result of diffing the wanted asset set against the subscribed one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

impl SubscriptionChange {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Shared price state between the feed writer and the engine
///
/// The writer only calls [`PriceFeed::on_tick`]. Each asset's entry is
/// replaced atomically (last write wins); there is no ordering across assets.
pub struct PriceFeed {
    prices: DashMap<String, PriceEntry>,
    aggregator: FeedAggregator,
    subscribed: Mutex<BTreeSet<String>>,
    commands: mpsc::UnboundedSender<FeedCommand>,
    stale_after: Duration,
}

impl PriceFeed {
    /// Create the feed and the command stream the ticker connection consumes
    pub fn new(
        aggregator: FeedAggregator,
        stale_after: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<FeedCommand>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let feed = Self {
            prices: DashMap::new(),
            aggregator,
            subscribed: Mutex::new(BTreeSet::new()),
            commands,
            stale_after,
        };
        (feed, receiver)
    }

    /// Record a tick (feed writer side)
    pub fn on_tick(&self, asset_id: &str, price: f64) {
        self.on_tick_at(asset_id, price, Utc::now());
    }

    pub fn on_tick_at(&self, asset_id: &str, price: f64, at: DateTime<Utc>) {
        if !price.is_finite() || price <= 0.0 {
            tracing::warn!(asset = %asset_id, price, "Ignoring invalid tick");
            return;
        }

        self.prices
            .entry(asset_id.to_string())
            .and_modify(|entry| {
                entry.previous = Some(entry.price);
                entry.price = price;
                entry.updated_at = at;
            })
            .or_insert(PriceEntry {
                price,
                previous: None,
                updated_at: at,
            });

        self.aggregator.record(asset_id, price, at);
    }

    pub fn latest_price(&self, asset_id: &str) -> Option<f64> {
        self.prices.get(asset_id).map(|e| e.price)
    }

    pub fn entry(&self, asset_id: &str) -> Option<PriceEntry> {
        self.prices.get(asset_id).map(|e| *e)
    }

    pub fn aggregator(&self) -> &FeedAggregator {
        &self.aggregator
    }

    /// Currently subscribed assets
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscribed
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribe to exactly `wanted`
    ///
    /// Unsubscribes removed assets before subscribing new ones.
    pub fn update_subscriptions(&self, wanted: &BTreeSet<String>) -> SubscriptionChange {
        let change = {
            let mut subscribed = match self.subscribed.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            let change = SubscriptionChange {
                removed: subscribed.difference(wanted).cloned().collect(),
                added: wanted.difference(&subscribed).cloned().collect(),
            };
            *subscribed = wanted.clone();
            change
        };

        if !change.removed.is_empty() {
            tracing::info!(assets = ?change.removed, "Unsubscribing from ticker feeds");
            self.send(FeedCommand::Unsubscribe(change.removed.clone()));
        }
        if !change.added.is_empty() {
            tracing::info!(assets = ?change.added, "Subscribing to ticker feeds");
            self.send(FeedCommand::Subscribe(change.added.clone()));
        }

        change
    }

    fn send(&self, command: FeedCommand) {
        if self.commands.send(command).is_err() {
            tracing::warn!("Ticker connection is gone; subscription change not delivered");
        }
    }

    /// Drop prices for untracked assets and prices too old to trade on
    pub fn clear_stale(&self) -> usize {
        self.clear_stale_at(Utc::now())
    }

    pub fn clear_stale_at(&self, now: DateTime<Utc>) -> usize {
        let subscribed: BTreeSet<String> = self.subscriptions().into_iter().collect();
        let before = self.prices.len();

        self.prices.retain(|asset, entry| {
            subscribed.contains(asset) && now - entry.updated_at <= self.stale_after
        });
        self.aggregator.retain(|asset| subscribed.contains(asset));

        let removed = before.saturating_sub(self.prices.len());
        if removed > 0 {
            tracing::debug!(removed, "Cleared stale price entries");
        }
        removed
    }
}
