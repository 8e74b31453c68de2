use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgExecutor, PgPool, Row};
use uuid::Uuid;

use super::JobStore;
use crate::models::{Job, JobStatus, Status};
use crate::{Error, Result};

const JOB_COLUMNS: &str = r#"
    job_id, asset_id, funds, size, starting_funds, cost_basis, previous_size,
    yield_threshold, total_yield_threshold, price_precision, expires_at,
    holding_asset, is_initializing, is_pending, is_active, crossed, extreme_value,
    force_trade_now, protect_stop, loss_floor, order_correlation_id,
    pending_funds_increase
"#;

fn to_decimal(value: f64, field: &str) -> Result<Decimal> {
    Decimal::try_from(value)
        .map_err(|_| Error::Persistence(format!("{} is not storable: {}", field, value)))
}

fn to_f64(row: &PgRow, column: &str) -> Result<f64> {
    let value: Decimal = row.try_get(column)?;
    value
        .to_f64()
        .ok_or_else(|| Error::Persistence(format!("{} out of range: {}", column, value)))
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let precision: i32 = row.try_get("price_precision")?;

    Ok(Job {
        job_id: row.try_get("job_id")?,
        asset_id: row.try_get("asset_id")?,
        funds: to_f64(row, "funds")?,
        size: to_f64(row, "size")?,
        starting_funds: to_f64(row, "starting_funds")?,
        cost_basis: to_f64(row, "cost_basis")?,
        previous_size: to_f64(row, "previous_size")?,
        yield_threshold: to_f64(row, "yield_threshold")?,
        total_yield_threshold: to_f64(row, "total_yield_threshold")?,
        price_precision: precision.max(0) as u32,
        expires_at: row.try_get::<DateTime<Utc>, _>("expires_at")?,
        holding_asset: row.try_get("holding_asset")?,
        is_initializing: row.try_get("is_initializing")?,
        is_pending: row.try_get("is_pending")?,
        is_active: row.try_get("is_active")?,
        crossed: row.try_get("crossed")?,
        extreme_value: to_f64(row, "extreme_value")?,
        force_trade_now: row.try_get("force_trade_now")?,
        protect_stop: row.try_get("protect_stop")?,
        loss_floor: to_f64(row, "loss_floor")?,
        order_correlation_id: row.try_get("order_correlation_id")?,
        pending_funds_increase: to_f64(row, "pending_funds_increase")?,
    })
}

fn status_from_row(row: &PgRow) -> Result<JobStatus> {
    let status_str: String = row.try_get("status")?;
    let status = Status::parse(&status_str)
        .ok_or_else(|| Error::Persistence(format!("Invalid job status '{}'", status_str)))?;

    Ok(JobStatus {
        job_id: row.try_get("job_id")?,
        status,
        gains_losses: to_f64(row, "gains_losses")?,
        current_value: to_f64(row, "current_value")?,
        current_funds: to_f64(row, "current_funds")?,
        starting_funds: to_f64(row, "starting_funds")?,
        last_price: to_f64(row, "last_price")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn upsert_job<'e, E>(executor: E, job: &Job) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO jobs (
            job_id, asset_id, funds, size, starting_funds, cost_basis, previous_size,
            yield_threshold, total_yield_threshold, price_precision, expires_at,
            holding_asset, is_initializing, is_pending, is_active, crossed, extreme_value,
            force_trade_now, protect_stop, loss_floor, order_correlation_id,
            pending_funds_increase
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
        ON CONFLICT (job_id) DO UPDATE SET
            funds = EXCLUDED.funds,
            size = EXCLUDED.size,
            starting_funds = EXCLUDED.starting_funds,
            cost_basis = EXCLUDED.cost_basis,
            previous_size = EXCLUDED.previous_size,
            yield_threshold = EXCLUDED.yield_threshold,
            total_yield_threshold = EXCLUDED.total_yield_threshold,
            price_precision = EXCLUDED.price_precision,
            expires_at = EXCLUDED.expires_at,
            holding_asset = EXCLUDED.holding_asset,
            is_initializing = EXCLUDED.is_initializing,
            is_pending = EXCLUDED.is_pending,
            is_active = EXCLUDED.is_active,
            crossed = EXCLUDED.crossed,
            extreme_value = EXCLUDED.extreme_value,
            force_trade_now = EXCLUDED.force_trade_now,
            protect_stop = EXCLUDED.protect_stop,
            loss_floor = EXCLUDED.loss_floor,
            order_correlation_id = EXCLUDED.order_correlation_id,
            pending_funds_increase = EXCLUDED.pending_funds_increase,
            updated_at = NOW()
        "#,
    )
    .bind(job.job_id)
    .bind(&job.asset_id)
    .bind(to_decimal(job.funds, "funds")?)
    .bind(to_decimal(job.size, "size")?)
    .bind(to_decimal(job.starting_funds, "starting_funds")?)
    .bind(to_decimal(job.cost_basis, "cost_basis")?)
    .bind(to_decimal(job.previous_size, "previous_size")?)
    .bind(to_decimal(job.yield_threshold, "yield_threshold")?)
    .bind(to_decimal(job.total_yield_threshold, "total_yield_threshold")?)
    .bind(job.price_precision as i32)
    .bind(job.expires_at)
    .bind(job.holding_asset)
    .bind(job.is_initializing)
    .bind(job.is_pending)
    .bind(job.is_active)
    .bind(job.crossed)
    .bind(to_decimal(job.extreme_value, "extreme_value")?)
    .bind(job.force_trade_now)
    .bind(job.protect_stop)
    .bind(to_decimal(job.loss_floor, "loss_floor")?)
    .bind(job.order_correlation_id)
    .bind(to_decimal(job.pending_funds_increase, "pending_funds_increase")?)
    .execute(executor)
    .await?;

    Ok(())
}

/// Postgres-backed job store
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Connect and run pending migrations
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres job store");

        Ok(Self { pool })
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!("SELECT {} FROM jobs ORDER BY created_at ASC", JOB_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE job_id = $1", JOB_COLUMNS))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        upsert_job(&self.pool, job).await?;
        tracing::debug!(job_id = %job.job_id, "Saved job to Postgres");
        Ok(())
    }

    async fn update_job(
        &self,
        job_id: Uuid,
        change: &mut (dyn for<'j> FnMut(&'j mut Job) + Send),
    ) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        // Row lock holds off other writers until commit
        let row = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE job_id = $1 FOR UPDATE",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let mut job = job_from_row(&row)?;
        change(&mut job);
        upsert_job(&mut *tx, &job).await?;
        tx.commit().await?;

        Ok(Some(job))
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_statuses(&self) -> Result<Vec<JobStatus>> {
        let rows = sqlx::query("SELECT * FROM job_statuses ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(status_from_row).collect()
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        let row = sqlx::query("SELECT * FROM job_statuses WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(status_from_row).transpose()
    }

    async fn save_status(&self, status: &JobStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_statuses (
                job_id, status, gains_losses, current_value, current_funds,
                starting_funds, last_price, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (job_id) DO UPDATE SET
                status = EXCLUDED.status,
                gains_losses = EXCLUDED.gains_losses,
                current_value = EXCLUDED.current_value,
                current_funds = EXCLUDED.current_funds,
                starting_funds = EXCLUDED.starting_funds,
                last_price = EXCLUDED.last_price,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(status.job_id)
        .bind(status.status.as_str())
        .bind(to_decimal(status.gains_losses, "gains_losses")?)
        .bind(to_decimal(status.current_value, "current_value")?)
        .bind(to_decimal(status.current_funds, "current_funds")?)
        .bind(to_decimal(status.starting_funds, "starting_funds")?)
        .bind(to_decimal(status.last_price, "last_price")?)
        .bind(status.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
