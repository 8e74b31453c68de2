use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{Job, JobStatus, Status};
use crate::store::{Generation, JobStore};
use crate::{Error, Result};

/// Parameters for a new job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub asset_id: String,
    pub funds: f64,
    pub yield_threshold: f64,
    pub total_yield_threshold: f64,
    pub price_precision: u32,
    pub expires_at: DateTime<Utc>,
    pub protect_stop: bool,
    pub loss_floor: f64,
}

impl NewJob {
    fn validate(&self) -> Result<()> {
        if self.asset_id.trim().is_empty() {
            return Err(Error::InvalidRequest("asset id is empty".to_string()));
        }
        if !self.funds.is_finite() || self.funds <= 0.0 {
            return Err(Error::InvalidRequest(format!("funds must be positive, got {}", self.funds)));
        }
        if !self.yield_threshold.is_finite() || self.yield_threshold <= 1.0 {
            return Err(Error::InvalidRequest(format!(
                "yield threshold must exceed 1.0, got {}",
                self.yield_threshold
            )));
        }
        if !self.total_yield_threshold.is_finite() || self.total_yield_threshold <= 1.0 {
            return Err(Error::InvalidRequest(format!(
                "total yield threshold must exceed 1.0, got {}",
                self.total_yield_threshold
            )));
        }
        if self.expires_at <= Utc::now() {
            return Err(Error::InvalidRequest("expiry is in the past".to_string()));
        }
        Ok(())
    }
}

/// How a funds increase was applied
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TopUp {
    /// Added to funds and starting funds right away
    Applied,
    /// Parked until the in-flight or next sell settles
    Deferred { pending_total: f64 },
}

/// Job management operations
///
/// Every edit is a single atomic row update touching only the fields job
/// management owns, so it never overwrites the engine's trading state (or
/// is overwritten by it). Bumps the shared generation afterwards.
pub struct JobAdmin {
    store: Arc<dyn JobStore>,
    generation: Generation,
}

impl JobAdmin {
    pub fn new(store: Arc<dyn JobStore>, generation: Generation) -> Self {
        Self { store, generation }
    }

    pub async fn create_job(&self, request: NewJob) -> Result<Job> {
        request.validate()?;

        let mut job = Job::new(
            request.asset_id,
            request.funds,
            request.yield_threshold,
            request.expires_at,
        );
        job.total_yield_threshold = request.total_yield_threshold;
        job.price_precision = request.price_precision;
        job.protect_stop = request.protect_stop;
        job.loss_floor = request.loss_floor;

        self.store.save_job(&job).await?;
        self.store.save_status(&JobStatus::for_job(&job)).await?;
        self.generation.bump();

        tracing::info!(
            job_id = %job.job_id,
            asset = %job.asset_id,
            funds = job.funds,
            yield_threshold = job.yield_threshold,
            "Job created"
        );

        Ok(job)
    }

    /// Expire the job now; the engine retires it on its next tick
    pub async fn stop_job(&self, job_id: Uuid) -> Result<Job> {
        let now = Utc::now();
        let job = self
            .store
            .update_job(job_id, &mut |job: &mut Job| job.expires_at = now)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;

        let mut status = self
            .store
            .get_status(job_id)
            .await?
            .unwrap_or_else(|| JobStatus::for_job(&job));
        status.status = Status::Stopped;
        status.updated_at = Utc::now();
        self.store.save_status(&status).await?;
        self.generation.bump();

        tracing::info!(job_id = %job_id, pending = job.is_pending, "Job stopped");

        Ok(job)
    }

    /// Add cash to a job without racing a settlement
    ///
    /// Funds only exist as cash when the job is idle and not holding the
    /// asset; otherwise the increase waits for the next sell to settle.
    pub async fn increase_funds(&self, job_id: Uuid, amount: f64) -> Result<TopUp> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(Error::InvalidRequest(format!("increase must be positive, got {}", amount)));
        }

        let mut outcome: Result<TopUp> = Err(Error::JobNotFound(job_id));
        let job = self
            .store
            .update_job(job_id, &mut |job: &mut Job| {
                outcome = if !job.is_active {
                    Err(Error::InvalidRequest(format!("job {} is no longer active", job_id)))
                } else if job.is_pending || job.holding_asset {
                    job.pending_funds_increase += amount;
                    Ok(TopUp::Deferred {
                        pending_total: job.pending_funds_increase,
                    })
                } else {
                    job.funds += amount;
                    job.starting_funds += amount;
                    Ok(TopUp::Applied)
                };
            })
            .await?
            .ok_or(Error::JobNotFound(job_id))?;
        let outcome = outcome?;

        if outcome == TopUp::Applied {
            if let Some(mut status) = self.store.get_status(job_id).await? {
                status.current_funds = job.funds;
                status.current_value = job.funds;
                status.starting_funds = job.starting_funds;
                status.updated_at = Utc::now();
                self.store.save_status(&status).await?;
            }
        }
        self.generation.bump();

        tracing::info!(job_id = %job_id, amount, ?outcome, "Funds increased");

        Ok(outcome)
    }

    /// Trade on the next evaluation regardless of trailing state
    pub async fn force_trade(&self, job_id: Uuid) -> Result<Job> {
        let job = self
            .store
            .update_job(job_id, &mut |job: &mut Job| job.force_trade_now = true)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;
        self.generation.bump();

        tracing::info!(job_id = %job_id, side = ?job.next_side(), "Forced trade scheduled");

        Ok(job)
    }

    pub async fn statuses(&self) -> Result<Vec<JobStatus>> {
        self.store.list_statuses().await
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobStatus> {
        self.store
            .get_status(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))
    }
}
