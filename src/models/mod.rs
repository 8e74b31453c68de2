use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::floor_currency;

/// One tracked position, cycling between holding cash and holding the asset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: Uuid,
    pub asset_id: String, // Exchange product id, e.g. "XLM-USD"

    // Economics
    pub funds: f64,          // Cash currently allocated
    pub size: f64,           // Asset quantity currently held
    pub starting_funds: f64,
    pub cost_basis: f64,     // Cash spent on the last buy
    pub previous_size: f64,  // Units disposed of on the last sell
    pub yield_threshold: f64,       // e.g. 1.10 = 10% per cycle
    pub total_yield_threshold: f64, // Lifetime deactivation target
    pub price_precision: u32,       // Decimal places the exchange honors
    pub expires_at: DateTime<Utc>,

    // Phase flags
    pub holding_asset: bool,
    pub is_initializing: bool,
    pub is_pending: bool,
    pub is_active: bool,

    // Trailing-threshold state
    pub crossed: bool,
    pub extreme_value: f64,

    // Overrides
    pub force_trade_now: bool,
    pub protect_stop: bool,
    pub loss_floor: f64, // Yield below which a protect stop may fire

    pub order_correlation_id: Uuid,
    pub pending_funds_increase: f64,
}

impl Job {
    /// New job in the INIT phase, holding `funds` in cash
    pub fn new(
        asset_id: impl Into<String>,
        funds: f64,
        yield_threshold: f64,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            asset_id: asset_id.into(),
            funds,
            size: 0.0,
            starting_funds: funds,
            cost_basis: 0.0,
            previous_size: 0.0,
            yield_threshold,
            total_yield_threshold: 10.0,
            price_precision: 2,
            expires_at,
            holding_asset: false,
            is_initializing: true,
            is_pending: false,
            is_active: true,
            crossed: false,
            extreme_value: 0.0,
            force_trade_now: false,
            protect_stop: false,
            loss_floor: 0.0,
            order_correlation_id: Uuid::new_v4(),
            pending_funds_increase: 0.0,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.holding_asset {
            Phase::Crest
        } else if self.is_initializing {
            Phase::Init
        } else {
            Phase::Trough
        }
    }

    /// Side of the next order this job would place
    pub fn next_side(&self) -> OrderSide {
        if self.holding_asset {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }

    /// Replace the correlation id so a later attempt can't match an old one
    pub fn regenerate_correlation_id(&mut self) {
        self.order_correlation_id = Uuid::new_v4();
    }

    /// Drop trailing state after a completed cycle
    pub fn reset_trail(&mut self) {
        self.crossed = false;
        self.extreme_value = 0.0;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Lifetime cash multiple has passed the deactivation target
    pub fn reached_total_target(&self) -> bool {
        if self.starting_funds <= 0.0 {
            return false;
        }
        self.funds / self.starting_funds > self.total_yield_threshold
    }

    /// Copy the fields the engine owns outside of settlement onto `self`
    ///
    /// Expiry, funds, deferred top-ups and the force flag belong to job
    /// management and are left as stored.
    pub fn adopt_engine_state(&mut self, engine: &Job) {
        self.is_active = engine.is_active;
        self.is_pending = engine.is_pending;
        self.crossed = engine.crossed;
        self.extreme_value = engine.extreme_value;
        self.order_correlation_id = engine.order_correlation_id;
    }

    /// Re-book cash added after a buy order for `funds_sent` went out
    ///
    /// The exchange only spends what was sent, so the difference waits for
    /// the next sell like any other deferred top-up.
    pub fn defer_late_top_up(&mut self, funds_sent: f64) {
        let late = self.funds - funds_sent;
        if late > 0.0 {
            self.funds = funds_sent;
            self.starting_funds -= late;
            self.pending_funds_increase += late;
        }
    }

    /// Only terminal jobs with nothing in flight may be removed
    pub fn is_removable(&self) -> bool {
        !self.is_active && !self.is_pending
    }
}

/// Logical phase of a job. Pending is an overlay on top of these.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    Init,
    Trough,
    Crest,
}

/// Externally reported lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Status {
    Running,
    Pending,
    Finished,
    Stopped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Running => "RUNNING",
            Status::Pending => "PENDING",
            Status::Finished => "FINISHED",
            Status::Stopped => "STOPPED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNNING" => Some(Status::Running),
            "PENDING" => Some(Status::Pending),
            "FINISHED" => Some(Status::Finished),
            "STOPPED" => Some(Status::Stopped),
            _ => None,
        }
    }
}

/// Reporting view of a job; outlives the job itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub status: Status,
    pub gains_losses: f64,
    pub current_value: f64,
    pub current_funds: f64,
    pub starting_funds: f64,
    pub last_price: f64,
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            status: Status::Running,
            gains_losses: 0.0,
            current_value: job.funds,
            current_funds: job.funds,
            starting_funds: job.starting_funds,
            last_price: 0.0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Market order: BUY spends `funds`, SELL disposes of `size`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub correlation_id: Uuid,
    pub asset_id: String,
    pub side: OrderSide,
    pub funds: Option<f64>,
    pub size: Option<f64>,
}

impl OrderRequest {
    /// Build the order a job would place right now
    ///
    /// Funds are floored to `currency_precision` places; the exchange
    /// rejects amounts finer than its quote increment.
    pub fn for_job(job: &Job, currency_precision: u32) -> Self {
        let side = job.next_side();
        let (funds, size) = match side {
            OrderSide::Buy => (Some(floor_currency(job.funds, currency_precision)), None),
            OrderSide::Sell => (None, Some(job.size)),
        };

        Self {
            correlation_id: job.order_correlation_id,
            asset_id: job.asset_id.clone(),
            side,
            funds,
            size,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub correlation_id: Uuid,
}

/// Execution report for a submitted order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub settled: bool,
    pub executed_value: f64,
    pub filled_size: f64,
    pub fees: f64,
}

/// 24h statistics for an asset
#[derive(Debug, Clone, PartialEq)]
pub struct MarketStats {
    pub open: f64,
    pub high: f64,
    pub low: f64,
}
