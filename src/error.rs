use thiserror::Error;

/// Failures the engine distinguishes when deciding what to retry
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed price, stats or order payload
    #[error("could not parse {0}")]
    TransientParse(String),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("rate limit exhausted")]
    RateLimited,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Missing credentials or settings; only raised at startup
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job {0} not found")]
    JobNotFound(uuid::Uuid),

    /// Rejected management request
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Network, HTTP or rate-limit failure talking to the exchange
    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            Error::Gateway(_) | Error::RateLimited | Error::Timeout(_) | Error::Http(_)
        )
    }

    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Error::Persistence(_) | Error::Database(_) | Error::Migration(_) | Error::Redis(_)
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Configuration(e.to_string())
    }
}
