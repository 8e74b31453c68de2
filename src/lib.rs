// Core modules
pub mod admin;
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod models;
pub mod persistence;
pub mod store;

// Re-export commonly used types
pub use admin::{JobAdmin, NewJob, TopUp};
pub use api::ExchangeGateway;
pub use config::Config;
pub use engine::{TickReport, TradingEngine};
pub use error::Error;
pub use feed::PriceFeed;
pub use models::*;
pub use store::{Generation, JobStore};

// Error handling
pub type Result<T> = std::result::Result<T, Error>;
