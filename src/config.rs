use crate::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://api.exchange.coinbase.com";
const DEFAULT_WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";

/// Runtime settings
///
/// Resolved in order: built-in defaults, optional `autotrader.toml`,
/// then `AUTOTRADER_*` environment variables (`.env` is loaded first).
#[derive(Clone, Deserialize)]
pub struct Config {
    pub tick_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub rate_limit_per_sec: u32,

    pub fee_rate: f64,
    pub currency_precision: u32,
    pub jitter_band: f64,
    pub price_stale_after_secs: i64,

    pub bucket_secs: i64,
    pub bucket_count: usize,

    pub api_url: String,
    pub ws_url: String,
    pub api_key: Option<String>,
    pub api_passphrase: Option<String>,
    pub api_secret: Option<String>,

    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redacted = |value: &Option<String>| value.as_ref().map(|_| "[REDACTED]");

        f.debug_struct("Config")
            .field("tick_interval_secs", &self.tick_interval_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("rate_limit_per_sec", &self.rate_limit_per_sec)
            .field("fee_rate", &self.fee_rate)
            .field("currency_precision", &self.currency_precision)
            .field("jitter_band", &self.jitter_band)
            .field("price_stale_after_secs", &self.price_stale_after_secs)
            .field("bucket_secs", &self.bucket_secs)
            .field("bucket_count", &self.bucket_count)
            .field("api_url", &self.api_url)
            .field("ws_url", &self.ws_url)
            .field("api_key", &self.api_key)
            .field("api_passphrase", &redacted(&self.api_passphrase))
            .field("api_secret", &redacted(&self.api_secret))
            .field("database_url", &redacted(&self.database_url))
            .field("redis_url", &self.redis_url)
            .finish()
    }
}

/// Exchange credentials; required before the engine may start
#[derive(Clone)]
pub struct Credentials {
    pub key: String,
    pub passphrase: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .field("passphrase", &"[REDACTED]")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            .set_default("tick_interval_secs", 30)?
            .set_default("request_timeout_secs", 10)?
            .set_default("rate_limit_per_sec", 5)?
            .set_default("fee_rate", 0.0149)?
            .set_default("currency_precision", 2)?
            .set_default("jitter_band", 0.005)?
            .set_default("price_stale_after_secs", 120)?
            .set_default("bucket_secs", 3600)?
            .set_default("bucket_count", 3)?
            .set_default("api_url", DEFAULT_API_URL)?
            .set_default("ws_url", DEFAULT_WS_URL)?
            .add_source(config::File::with_name("autotrader").required(false))
            .add_source(config::Environment::with_prefix("AUTOTRADER").try_parsing(true))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.fee_rate) {
            return Err(Error::Configuration(format!(
                "fee_rate must be in [0, 1), got {}",
                self.fee_rate
            )));
        }
        if self.tick_interval_secs == 0 || self.rate_limit_per_sec == 0 {
            return Err(Error::Configuration(
                "tick_interval_secs and rate_limit_per_sec must be positive".to_string(),
            ));
        }
        if self.bucket_secs <= 0 || self.bucket_count == 0 {
            return Err(Error::Configuration(
                "bucket_secs and bucket_count must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Exchange credentials, or a configuration error naming what is missing
    pub fn credentials(&self) -> Result<Credentials> {
        let require = |value: &Option<String>, name: &str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Configuration(format!("AUTOTRADER_{} is not set", name)))
        };

        Ok(Credentials {
            key: require(&self.api_key, "API_KEY")?,
            passphrase: require(&self.api_passphrase, "API_PASSPHRASE")?,
            secret: require(&self.api_secret, "API_SECRET")?,
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            request_timeout_secs: 10,
            rate_limit_per_sec: 5,
            fee_rate: 0.0149,
            currency_precision: 2,
            jitter_band: 0.005,
            price_stale_after_secs: 120,
            bucket_secs: 3600,
            bucket_count: 3,
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            api_key: None,
            api_passphrase: None,
            api_secret: None,
            database_url: None,
            redis_url: None,
        }
    }
}
