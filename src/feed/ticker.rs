use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::Message;

use super::{FeedCommand, PriceFeed};
use crate::{Error, Result};

const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 60_000;
const TICKER_CHANNEL: &str = "ticker";

#[derive(Debug, Deserialize)]
struct FeedMessage {
    #[serde(rename = "type")]
    kind: String,
    product_id: Option<String>,
    price: Option<String>,
    message: Option<String>,
}

/// Parse one feed frame into `(asset, price)` if it is a ticker update
pub fn decode_ticker(text: &str) -> Result<Option<(String, f64)>> {
    let message: FeedMessage = serde_json::from_str(text)?;

    match message.kind.as_str() {
        "ticker" => {
            let (Some(asset), Some(price)) = (message.product_id, message.price) else {
                return Ok(None);
            };
            let price: f64 = price
                .parse()
                .map_err(|_| Error::TransientParse(format!("ticker price '{}' for {}", price, asset)))?;
            Ok(Some((asset, price)))
        }
        "error" => Err(Error::Gateway(
            message.message.unwrap_or_else(|| "feed error".to_string()),
        )),
        _ => Ok(None),
    }
}

/// Reconnect delay: doubles per failed attempt, back to the start once a
/// session is established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Backoff {
    next_ms: u64,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next_ms: INITIAL_BACKOFF_MS,
        }
    }

    /// Delay before the next attempt
    fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_millis(self.next_ms);
        self.next_ms = (self.next_ms * 2).min(MAX_BACKOFF_MS);
        delay
    }

    fn reset(&mut self) {
        self.next_ms = INITIAL_BACKOFF_MS;
    }
}

fn subscription_message(kind: &str, assets: &[String]) -> String {
    serde_json::json!({
        "type": kind,
        "product_ids": assets,
        "channels": [TICKER_CHANNEL],
    })
    .to_string()
}

/// Long-lived WebSocket connection that writes ticks into a [`PriceFeed`]
///
/// Reconnects with exponential backoff and re-subscribes to the feed's
/// current asset set after every reconnect.
pub struct TickerConnection {
    url: String,
    feed: Arc<PriceFeed>,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
}

impl TickerConnection {
    pub fn new(
        url: impl Into<String>,
        feed: Arc<PriceFeed>,
        commands: mpsc::UnboundedReceiver<FeedCommand>,
    ) -> Self {
        Self {
            url: url.into(),
            feed,
            commands,
        }
    }

    /// Run until the command channel closes
    pub async fn run(mut self) {
        let mut backoff = Backoff::new();

        loop {
            match self.connect_and_stream(&mut backoff).await {
                Ok(()) => {
                    tracing::info!("Ticker command channel closed; stopping feed");
                    return;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "Ticker connection lost: {}. Reconnecting in {}ms...",
                        e,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Ok(()) means shut down; Err means reconnect
    async fn connect_and_stream(&mut self, backoff: &mut Backoff) -> Result<()> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Gateway(format!("WebSocket connection failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        // Queued commands are already reflected in the feed's subscription set
        while self.commands.try_recv().is_ok() {}

        let assets = self.feed.subscriptions();
        if !assets.is_empty() {
            write
                .send(Message::Text(subscription_message("subscribe", &assets)))
                .await
                .map_err(|e| Error::Gateway(format!("Subscription failed: {}", e)))?;
        }
        backoff.reset();
        tracing::info!(assets = ?assets, "Ticker feed connected");

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    };
                    let text = match &command {
                        FeedCommand::Subscribe(assets) => subscription_message("subscribe", assets),
                        FeedCommand::Unsubscribe(assets) => subscription_message("unsubscribe", assets),
                    };
                    write
                        .send(Message::Text(text))
                        .await
                        .map_err(|e| Error::Gateway(format!("Subscription update failed: {}", e)))?;
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(Error::Gateway("ticker stream closed".to_string()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(Error::Gateway(format!("WebSocket error: {}", e)));
                        }
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match decode_ticker(text) {
            Ok(Some((asset, price))) => self.feed.on_tick(&asset, price),
            Ok(None) => {}
            Err(e) => tracing::warn!("Dropping feed message: {}", e),
        }
    }
}
