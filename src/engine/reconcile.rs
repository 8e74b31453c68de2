use chrono::Utc;
use uuid::Uuid;

use super::yield_model::floor_currency;
use crate::models::{Job, JobStatus, OrderFill, Status};
use crate::{Error, Result};

/// Settled order report queued for the engine loop
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub job_id: Uuid,
    pub correlation_id: Uuid,
    pub fill: OrderFill,
}

/// Why a queued settlement was not applied
#[derive(Debug, Clone, PartialEq)]
pub enum StaleReason {
    NotPending,
    CorrelationMismatch { expected: Uuid, got: Uuid },
}

/// A settlement applies only to the attempt it was polled for
pub fn check_current(job: &Job, settlement: &Settlement) -> std::result::Result<(), StaleReason> {
    if !job.is_pending {
        return Err(StaleReason::NotPending);
    }
    if job.order_correlation_id != settlement.correlation_id {
        return Err(StaleReason::CorrelationMismatch {
            expected: job.order_correlation_id,
            got: settlement.correlation_id,
        });
    }
    Ok(())
}

/// Absorb a settled fill into the job and its status
///
/// Flips the job between holding cash and holding the asset, applies any
/// deferred top-up, and clears pending/trailing state. Leaves the job
/// untouched if the fill is unusable.
pub fn reconcile(
    job: &mut Job,
    status: &mut JobStatus,
    fill: &OrderFill,
    currency_precision: u32,
) -> Result<()> {
    if !fill.executed_value.is_finite()
        || !fill.fees.is_finite()
        || !fill.filled_size.is_finite()
        || fill.filled_size <= 0.0
    {
        return Err(Error::TransientParse(format!(
            "fill for job {} (value {}, size {}, fees {})",
            job.job_id, fill.executed_value, fill.filled_size, fill.fees
        )));
    }

    let value = floor_currency(fill.executed_value - fill.fees, currency_precision);

    if !job.holding_asset {
        job.cost_basis = job.funds;
        job.size = fill.filled_size;
        job.funds = 0.0;
        job.holding_asset = true;

        status.current_funds = 0.0;
        status.current_value = value;
    } else {
        job.previous_size = job.size;
        job.funds = value;
        job.size = 0.0;
        job.holding_asset = false;

        if job.pending_funds_increase > 0.0 {
            if job.is_active {
                job.funds = floor_currency(job.funds + job.pending_funds_increase, currency_precision);
                job.starting_funds = floor_currency(
                    job.starting_funds + job.pending_funds_increase,
                    currency_precision,
                );
                tracing::info!(
                    job_id = %job.job_id,
                    increase = job.pending_funds_increase,
                    "Applied deferred funds increase"
                );
            } else {
                tracing::warn!(
                    job_id = %job.job_id,
                    increase = job.pending_funds_increase,
                    "Job deactivated; deferred funds increase forfeited"
                );
            }
            job.pending_funds_increase = 0.0;
        }

        status.current_funds = job.funds;
        status.current_value = job.funds;
    }

    job.is_pending = false;
    job.is_initializing = false;
    job.force_trade_now = false;
    job.reset_trail();
    job.regenerate_correlation_id();

    status.status = if !job.is_active && !job.holding_asset {
        Status::Finished
    } else {
        Status::Running
    };
    status.starting_funds = job.starting_funds;
    status.last_price = fill.executed_value / fill.filled_size;
    status.gains_losses = value - job.starting_funds;
    status.updated_at = Utc::now();

    Ok(())
}
