// Trading engine: serialized tick loop over every job
pub mod reconcile;
pub mod trigger;
pub mod yield_model;

pub use reconcile::{check_current, reconcile, Settlement, StaleReason};
pub use trigger::{Direction, TrailDecision, TrailingTrigger};
pub use yield_model::{floor_currency, round_price, YieldModel};

use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::api::ExchangeGateway;
use crate::config::Config;
use crate::feed::{PriceEntry, PriceFeed};
use crate::models::{Job, JobStatus, OrderFill, OrderRequest, OrderSide, Phase, Status};
use crate::store::{Generation, JobStore};
use crate::{Error, Result};

/// A single partial bucket is too noisy to anchor the INIT baseline on
const MIN_BASELINE_SEGMENTS: usize = 2;

/// Counters for one tick, logged as a single summary line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub loaded: usize,
    pub deactivated: usize,
    pub deleted: usize,
    pub polls_started: usize,
    pub settlements_applied: usize,
    pub settlements_discarded: usize,
    pub orders_submitted: usize,
    pub submit_failures: usize,
    pub failures: usize,
}

impl TickReport {
    pub fn log(&self) {
        tracing::info!(
            loaded = self.loaded,
            deactivated = self.deactivated,
            deleted = self.deleted,
            polls = self.polls_started,
            settled = self.settlements_applied,
            discarded = self.settlements_discarded,
            submitted = self.orders_submitted,
            submit_failures = self.submit_failures,
            failures = self.failures,
            "Tick complete"
        );
    }

    fn absorb(&mut self, other: TickReport) {
        self.settlements_applied += other.settlements_applied;
        self.settlements_discarded += other.settlements_discarded;
        self.failures += other.failures;
    }
}

/// What evaluating one job did
#[derive(Debug, Clone, Copy, PartialEq)]
enum Evaluation {
    NoPrice,
    Idle,
    Updated,
    Submitted,
    /// Accepted by the exchange, pending flag not yet saved
    SubmittedUnsaved,
    SubmitFailed,
}

/// Phase evaluators' verdict
#[derive(Debug, Clone, Copy, PartialEq)]
enum Action {
    Hold { mutated: bool },
    Trade { metric: Option<f64>, protect: bool },
}

impl Action {
    fn from_decision(decision: TrailDecision, metric: Option<f64>) -> Self {
        match decision {
            TrailDecision::Fire => Action::Trade {
                metric,
                protect: false,
            },
            other => Action::Hold {
                mutated: other.mutated(),
            },
        }
    }
}

/// An order the exchange took whose pending state still has to be saved
#[derive(Debug, Clone)]
struct AcceptedOrder {
    job: Job,
    funds_sent: Option<f64>,
    price: f64,
}

/// Result of one order-status poll, handed back to the tick loop
#[derive(Debug)]
struct PollOutcome {
    job_id: Uuid,
    correlation_id: Uuid,
    result: Result<OrderFill>,
}

/// Use the previous price when the latest move is inside the jitter band
pub fn smoothed_price(entry: &PriceEntry, jitter_band: f64) -> f64 {
    match entry.previous {
        Some(previous) if previous > 0.0 => {
            let ratio = entry.price / previous;
            if ratio > 1.0 - jitter_band && ratio < 1.0 + jitter_band {
                previous
            } else {
                entry.price
            }
        }
        _ => entry.price,
    }
}

/// Stop-loss escape hatch for a held position
///
/// Fires only when the recent ceiling sits below break-even and the
/// position's yield has already dropped under the loss floor.
pub fn protect_stop_triggered(
    ceiling: f64,
    break_even: f64,
    current_yield: f64,
    loss_floor: f64,
) -> bool {
    ceiling < break_even && current_yield < loss_floor
}

/// Owns every job mutation
///
/// Ticks are strictly serialized. Status polls run as detached tasks whose
/// results are drained at the start of the next tick, so settlements never
/// race an evaluation of the same job.
pub struct TradingEngine {
    store: Arc<dyn JobStore>,
    gateway: Arc<dyn ExchangeGateway>,
    feed: Arc<PriceFeed>,
    yield_model: YieldModel,
    generation: Generation,
    currency_precision: u32,
    jitter_band: f64,
    tick_interval: Duration,
    request_timeout: Duration,
    polls: JoinSet<PollOutcome>,
    in_flight: HashMap<TaskId, Uuid>,
    unsaved: HashMap<Uuid, AcceptedOrder>,
}

impl TradingEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        gateway: Arc<dyn ExchangeGateway>,
        feed: Arc<PriceFeed>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            gateway,
            feed,
            yield_model: YieldModel::new(config.fee_rate),
            generation: Generation::new(),
            currency_precision: config.currency_precision,
            jitter_band: config.jitter_band,
            tick_interval: config.tick_interval(),
            request_timeout: config.request_timeout(),
            polls: JoinSet::new(),
            in_flight: HashMap::new(),
            unsaved: HashMap::new(),
        }
    }

    /// Share an existing counter (e.g. resumed from Redis, or held by admin)
    pub fn with_generation(mut self, generation: Generation) -> Self {
        self.generation = generation;
        self
    }

    pub fn generation(&self) -> Generation {
        self.generation.clone()
    }

    pub fn feed(&self) -> &Arc<PriceFeed> {
        &self.feed
    }

    /// Number of status polls still running
    pub fn polls_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Accepted orders whose pending state has not reached the store yet
    pub fn unsaved_orders(&self) -> usize {
        self.unsaved.len()
    }

    /// Run ticks until Ctrl-C
    pub async fn run(self) -> TickReport {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run ticks until `shutdown` resolves, then settle outstanding polls once
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> TickReport {
        let mut ticker = interval_at(Instant::now(), self.tick_interval);
        // A slow tick delays the next one instead of stacking them
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            interval_secs = self.tick_interval.as_secs(),
            "Trading engine started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await.log();
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, stopping scheduler");
                    break;
                }
            }
        }

        let mut report = TickReport::default();
        self.retry_unsaved(&mut report).await;
        if !self.unsaved.is_empty() {
            tracing::error!(
                jobs = ?self.unsaved.keys().collect::<Vec<_>>(),
                "Stopping with accepted orders that were never marked pending"
            );
        }
        report.absorb(self.flush_polls().await);
        tracing::info!(
            settled = report.settlements_applied,
            "Trading engine stopped"
        );
        report
    }

    /// One scheduler pass. Never fails; per-job errors are logged and counted.
    ///
    /// The feed is subscribed to assets of jobs that are active or still
    /// hold the asset, so a deactivated job keeps its prices until it has
    /// sold out. Jobs whose accepted order is not yet saved as pending sit
    /// out the pass until the save goes through.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        // Settlements that arrived since the last tick
        while let Some(joined) = self.polls.try_join_next_with_id() {
            let outcome = self.absorb_poll(joined).await;
            report.absorb(outcome);
        }

        self.retry_unsaved(&mut report).await;

        let mut jobs = match self.store.list_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!("Failed to list jobs: {}", e);
                report.failures += 1;
                return report;
            }
        };
        report.loaded = jobs.len();

        let wanted: BTreeSet<String> = jobs
            .iter()
            .filter(|j| j.is_active || j.holding_asset)
            .map(|j| j.asset_id.clone())
            .collect();
        self.feed.update_subscriptions(&wanted);

        if jobs.is_empty() {
            self.feed.clear_stale();
            return report;
        }
        jobs.retain(|j| !self.unsaved.contains_key(&j.job_id));

        // Deactivate
        let now = Utc::now();
        let mut deactivated = HashSet::new();
        for job in jobs.iter_mut().filter(|j| j.is_active) {
            if !job.is_expired(now) && !job.reached_total_target() {
                continue;
            }
            match self.deactivate(job).await {
                Ok(()) => {
                    deactivated.insert(job.job_id);
                    report.deactivated += 1;
                }
                Err(e) => {
                    tracing::error!(job_id = %job.job_id, "Failed to deactivate job: {}", e);
                    report.failures += 1;
                }
            }
        }

        // Cleanup; jobs retired this tick are removed on the next one
        let mut deleted = HashSet::new();
        for job in jobs
            .iter()
            .filter(|j| j.is_removable() && !deactivated.contains(&j.job_id))
        {
            match self.store.delete_job(job.job_id).await {
                Ok(()) => {
                    self.generation.bump();
                    deleted.insert(job.job_id);
                    tracing::info!(job_id = %job.job_id, asset = %job.asset_id, "Deleted finished job");
                }
                Err(e) => {
                    tracing::error!(job_id = %job.job_id, "Failed to delete job: {}", e);
                    report.failures += 1;
                }
            }
        }
        report.deleted = deleted.len();
        jobs.retain(|j| !deleted.contains(&j.job_id));

        // Reconcile pending
        for job in jobs.iter().filter(|j| j.is_pending) {
            if self.in_flight.values().any(|id| *id == job.job_id) {
                continue;
            }
            self.spawn_poll(job);
            report.polls_started += 1;
        }

        // Evaluate
        for job in jobs
            .iter_mut()
            .filter(|j| (j.is_active || j.holding_asset) && !j.is_pending)
        {
            match self.evaluate(job).await {
                Ok(Evaluation::Submitted) => report.orders_submitted += 1,
                Ok(Evaluation::SubmittedUnsaved) => {
                    report.orders_submitted += 1;
                    report.failures += 1;
                }
                Ok(Evaluation::SubmitFailed) => report.submit_failures += 1,
                Ok(Evaluation::NoPrice | Evaluation::Idle | Evaluation::Updated) => {}
                Err(e) => {
                    tracing::error!(
                        job_id = %job.job_id,
                        asset = %job.asset_id,
                        "Job evaluation failed: {}",
                        e
                    );
                    report.failures += 1;
                }
            }
        }

        self.feed.clear_stale();
        report
    }

    /// Wait for every outstanding status poll and apply its result
    pub async fn flush_polls(&mut self) -> TickReport {
        let mut report = TickReport::default();
        while let Some(joined) = self.polls.join_next_with_id().await {
            let outcome = self.absorb_poll(joined).await;
            report.absorb(outcome);
        }
        report
    }

    async fn deactivate(&self, job: &mut Job) -> Result<()> {
        let mut updated = job.clone();
        updated.is_active = false;
        self.persist(&mut updated).await?;

        tracing::info!(
            job_id = %updated.job_id,
            asset = %updated.asset_id,
            expired = updated.expires_at < Utc::now(),
            "Job deactivated"
        );

        if !updated.holding_asset && !updated.is_pending {
            let mut status = self.load_status(&updated).await?;
            if status.status != Status::Stopped {
                status.status = Status::Finished;
            }
            status.current_funds = updated.funds;
            status.current_value = updated.funds;
            status.updated_at = Utc::now();
            self.store.save_status(&status).await?;
        }

        *job = updated;
        Ok(())
    }

    fn spawn_poll(&mut self, job: &Job) {
        let gateway = Arc::clone(&self.gateway);
        let timeout = self.request_timeout;
        let job_id = job.job_id;
        let correlation_id = job.order_correlation_id;

        let handle = self.polls.spawn(async move {
            let result = match tokio::time::timeout(timeout, gateway.order_status(correlation_id)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout("order status")),
            };
            PollOutcome {
                job_id,
                correlation_id,
                result,
            }
        });
        self.in_flight.insert(handle.id(), job_id);

        tracing::debug!(job_id = %job_id, %correlation_id, "Polling order status");
    }

    async fn absorb_poll(
        &mut self,
        joined: std::result::Result<(TaskId, PollOutcome), JoinError>,
    ) -> TickReport {
        let mut report = TickReport::default();

        let outcome = match joined {
            Ok((id, outcome)) => {
                self.in_flight.remove(&id);
                outcome
            }
            Err(e) => {
                self.in_flight.remove(&e.id());
                tracing::error!("Order status task failed: {}", e);
                report.failures += 1;
                return report;
            }
        };

        let fill = match outcome.result {
            Ok(fill) => fill,
            Err(e) => {
                tracing::warn!(job_id = %outcome.job_id, "Order status poll failed: {}", e);
                report.failures += 1;
                return report;
            }
        };

        if !fill.settled {
            tracing::debug!(job_id = %outcome.job_id, "Order not settled yet");
            return report;
        }

        let settlement = Settlement {
            job_id: outcome.job_id,
            correlation_id: outcome.correlation_id,
            fill,
        };
        match self.apply_settlement(&settlement).await {
            Ok(true) => report.settlements_applied += 1,
            Ok(false) => report.settlements_discarded += 1,
            Err(e) => {
                tracing::error!(job_id = %settlement.job_id, "Failed to apply settlement: {}", e);
                report.failures += 1;
            }
        }
        report
    }

    /// Apply a settlement exactly once; returns false if it was stale
    ///
    /// The currency check and the flip happen under the store's row update,
    /// so a top-up or stop landing meanwhile is folded in, not overwritten.
    async fn apply_settlement(&self, settlement: &Settlement) -> Result<bool> {
        let precision = self.currency_precision;
        let mut status = self.store.get_status(settlement.job_id).await?;
        let stopped = status.as_ref().is_some_and(|s| s.status == Status::Stopped);
        let mut verdict: Result<bool> = Ok(false);
        let mut side: Option<OrderSide> = None;

        let updated = self
            .store
            .update_job(settlement.job_id, &mut |job: &mut Job| {
                if let Err(reason) = check_current(job, settlement) {
                    tracing::warn!(job_id = %job.job_id, ?reason, "Discarding stale settlement");
                    return;
                }

                let status = status.get_or_insert_with(|| JobStatus::for_job(job));
                let mut settled = job.clone();
                verdict = reconcile(&mut settled, status, &settlement.fill, precision).map(|()| true);
                if matches!(verdict, Ok(true)) {
                    side = Some(job.next_side());
                    *job = settled;
                }
            })
            .await?;

        let Some(job) = updated else {
            tracing::debug!(job_id = %settlement.job_id, "Settlement for a deleted job");
            return Ok(false);
        };
        if !verdict? {
            return Ok(false);
        }

        let mut status = status.unwrap_or_else(|| JobStatus::for_job(&job));
        if stopped && status.status == Status::Finished {
            status.status = Status::Stopped;
        }
        self.store.save_status(&status).await?;
        self.generation.bump();

        tracing::info!(
            job_id = %job.job_id,
            asset = %job.asset_id,
            ?side,
            price = status.last_price,
            funds = job.funds,
            size = job.size,
            "Order settled"
        );

        Ok(true)
    }

    /// Write the engine's fields of `job` over the stored row, then reload it
    async fn persist(&self, job: &mut Job) -> Result<()> {
        let engine_view = job.clone();
        let stored = self
            .store
            .update_job(job.job_id, &mut |stored: &mut Job| {
                stored.adopt_engine_state(&engine_view)
            })
            .await?
            .ok_or(Error::JobNotFound(engine_view.job_id))?;
        self.generation.bump();

        *job = stored;
        Ok(())
    }

    /// Save an accepted order's pending state and PENDING status
    async fn mark_pending(&self, accepted: &AcceptedOrder) -> Result<Job> {
        let engine_view = &accepted.job;
        let stored = self
            .store
            .update_job(engine_view.job_id, &mut |stored: &mut Job| {
                stored.adopt_engine_state(engine_view);
                if let Some(funds) = accepted.funds_sent {
                    stored.defer_late_top_up(funds);
                }
            })
            .await?
            .ok_or(Error::JobNotFound(engine_view.job_id))?;
        self.generation.bump();

        let mut status = self.load_status(&stored).await?;
        status.status = Status::Pending;
        status.last_price = accepted.price;
        status.updated_at = Utc::now();
        self.store.save_status(&status).await?;

        Ok(stored)
    }

    /// Retry saving orders the exchange accepted on an earlier tick
    async fn retry_unsaved(&mut self, report: &mut TickReport) {
        let waiting: Vec<AcceptedOrder> = self.unsaved.values().cloned().collect();

        for accepted in waiting {
            let job_id = accepted.job.job_id;
            match self.mark_pending(&accepted).await {
                Ok(_) => {
                    self.unsaved.remove(&job_id);
                    tracing::info!(job_id = %job_id, "Saved pending state for accepted order");
                }
                Err(Error::JobNotFound(_)) => {
                    self.unsaved.remove(&job_id);
                    tracing::warn!(job_id = %job_id, "Job with an accepted order was deleted");
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, "Still unable to save accepted order: {}", e);
                    report.failures += 1;
                }
            }
        }
    }

    async fn load_status(&self, job: &Job) -> Result<JobStatus> {
        Ok(self
            .store
            .get_status(job.job_id)
            .await?
            .unwrap_or_else(|| JobStatus::for_job(job)))
    }

    /// Price to evaluate against, smoothed and rounded to the job's precision
    fn current_price(&self, job: &Job) -> Option<f64> {
        let entry = self.feed.entry(&job.asset_id)?;
        Some(round_price(
            smoothed_price(&entry, self.jitter_band),
            job.price_precision,
        ))
    }

    async fn evaluate(&mut self, job: &mut Job) -> Result<Evaluation> {
        let Some(price) = self.current_price(job) else {
            tracing::debug!(job_id = %job.job_id, asset = %job.asset_id, "No price yet");
            return Ok(Evaluation::NoPrice);
        };

        let action = if job.force_trade_now {
            tracing::info!(job_id = %job.job_id, "Forced trade requested");
            Action::Trade {
                metric: None,
                protect: false,
            }
        } else {
            match job.phase() {
                Phase::Init => self.evaluate_init(job, price).await?,
                Phase::Trough => self.evaluate_trough(job, price)?,
                Phase::Crest => self.evaluate_crest(job, price)?,
            }
        };

        match action {
            Action::Hold { mutated: false } => Ok(Evaluation::Idle),
            Action::Hold { mutated: true } => {
                self.persist(job).await?;
                Ok(Evaluation::Updated)
            }
            Action::Trade { metric, protect } => {
                if let Some(y) = metric.filter(|y| *y < 1.0) {
                    tracing::warn!(
                        job_id = %job.job_id,
                        yield_ = y,
                        "Trading at a loss"
                    );
                }
                self.submit(job, price, protect).await
            }
        }
    }

    /// INIT: buy once price dips below the baseline and turns back up
    async fn evaluate_init(&self, job: &mut Job, price: f64) -> Result<Action> {
        let baseline = round_price(self.baseline(&job.asset_id).await?, job.price_precision);
        let decision = TrailingTrigger::new(Direction::Falling, baseline).observe(job, price);

        if let TrailDecision::Crossed { extreme } = decision {
            tracing::info!(job_id = %job.job_id, baseline, extreme, "Price dipped below baseline");
        }

        Ok(Action::from_decision(decision, None))
    }

    /// TROUGH: buy back once acquisition yield peaks above the threshold
    fn evaluate_trough(&self, job: &mut Job, price: f64) -> Result<Action> {
        if job.previous_size <= 0.0 {
            return Err(Error::TransientParse(format!(
                "job {} has no previous size to measure against",
                job.job_id
            )));
        }

        let metric = self
            .yield_model
            .acquisition_yield(job.funds, price, job.previous_size);
        let decision = TrailingTrigger::new(Direction::Rising, job.yield_threshold).observe(job, metric);

        tracing::debug!(
            job_id = %job.job_id,
            price,
            yield_ = metric,
            target = self.yield_model.acquisition_target_price(job.funds, job.previous_size, job.yield_threshold),
            "Trough evaluation"
        );
        if let TrailDecision::Crossed { extreme } = decision {
            tracing::info!(job_id = %job.job_id, extreme, "Acquisition yield crossed threshold");
        }

        Ok(Action::from_decision(decision, Some(metric)))
    }

    /// CREST: sell once disposal yield peaks above the threshold
    fn evaluate_crest(&self, job: &mut Job, price: f64) -> Result<Action> {
        if job.cost_basis <= 0.0 || job.size <= 0.0 {
            return Err(Error::TransientParse(format!(
                "job {} holds no position to measure against",
                job.job_id
            )));
        }

        let metric = self.yield_model.disposal_yield(job.size, price, job.cost_basis);

        if job.protect_stop {
            let break_even = round_price(job.cost_basis / job.size, job.price_precision);
            let ceiling = self
                .feed
                .aggregator()
                .window(&job.asset_id)
                .map(|w| w.ceiling)
                .unwrap_or(f64::INFINITY);

            if protect_stop_triggered(ceiling, break_even, metric, job.loss_floor) {
                tracing::warn!(
                    job_id = %job.job_id,
                    ceiling,
                    break_even,
                    yield_ = metric,
                    "Protect stop triggered"
                );
                return Ok(Action::Trade {
                    metric: Some(metric),
                    protect: true,
                });
            }
        }

        let decision = TrailingTrigger::new(Direction::Rising, job.yield_threshold).observe(job, metric);

        tracing::debug!(
            job_id = %job.job_id,
            price,
            yield_ = metric,
            target = self.yield_model.disposal_target_price(job.cost_basis, job.size, job.yield_threshold),
            "Crest evaluation"
        );
        if let TrailDecision::Crossed { extreme } = decision {
            tracing::info!(job_id = %job.job_id, extreme, "Disposal yield crossed threshold");
        }

        Ok(Action::from_decision(decision, Some(metric)))
    }

    /// Rolling mid-price once enough buckets exist, else the exchange's 24h open
    async fn baseline(&self, asset_id: &str) -> Result<f64> {
        if let Some(window) = self
            .feed
            .aggregator()
            .window(asset_id)
            .filter(|w| w.segments >= MIN_BASELINE_SEGMENTS)
        {
            return Ok(window.mid);
        }

        let stats = tokio::time::timeout(self.request_timeout, self.gateway.market_stats(asset_id))
            .await
            .map_err(|_| Error::Timeout("market stats"))??;

        if !stats.open.is_finite() || stats.open <= 0.0 {
            return Err(Error::TransientParse(format!(
                "market stats open for {}: {}",
                asset_id, stats.open
            )));
        }
        Ok(stats.open)
    }

    async fn submit(&mut self, job: &mut Job, price: f64, protect: bool) -> Result<Evaluation> {
        let request = OrderRequest::for_job(job, self.currency_precision);

        let submitted = tokio::time::timeout(self.request_timeout, self.gateway.submit_order(&request))
            .await
            .unwrap_or(Err(Error::Timeout("submit order")));

        match submitted {
            Ok(ack) => {
                if ack.correlation_id != request.correlation_id {
                    tracing::warn!(
                        job_id = %job.job_id,
                        sent = %request.correlation_id,
                        acked = %ack.correlation_id,
                        "Exchange acknowledged a different correlation id"
                    );
                }

                tracing::info!(
                    job_id = %job.job_id,
                    asset = %job.asset_id,
                    side = ?request.side,
                    price,
                    funds = ?request.funds,
                    size = ?request.size,
                    correlation_id = %request.correlation_id,
                    "Order submitted"
                );

                job.is_pending = true;
                if protect {
                    job.is_active = false;
                }
                let accepted = AcceptedOrder {
                    job: job.clone(),
                    funds_sent: request.funds,
                    price,
                };

                match self.mark_pending(&accepted).await {
                    Ok(stored) => {
                        *job = stored;
                        Ok(Evaluation::Submitted)
                    }
                    Err(e) => {
                        // The order is live; never let this job trade again before it is saved
                        tracing::error!(
                            job_id = %job.job_id,
                            correlation_id = %request.correlation_id,
                            "Order accepted but pending state not saved, retrying next tick: {}",
                            e
                        );
                        self.unsaved.insert(job.job_id, accepted);
                        Ok(Evaluation::SubmittedUnsaved)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.job_id,
                    asset = %job.asset_id,
                    side = ?request.side,
                    "Order submission failed, will retry: {}",
                    e
                );
                job.regenerate_correlation_id();
                self.persist(job).await?;
                Ok(Evaluation::SubmitFailed)
            }
        }
    }
}
