use async_trait::async_trait;
use autotrader::feed::{FeedAggregator, FeedCommand};
use autotrader::store::MemoryJobStore;
use autotrader::*;
use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

const XLM: &str = "XLM-USD";
const BTC: &str = "BTC-USD";

/// Exchange double: records orders and replays canned fills/stats
#[derive(Default)]
struct ScriptedGateway {
    orders: Mutex<Vec<OrderRequest>>,
    fills: Mutex<HashMap<Uuid, OrderFill>>,
    stats: Mutex<HashMap<String, MarketStats>>,
    failing_assets: Mutex<HashSet<String>>,
    status_calls: AtomicUsize,
    status_delay: Option<std::time::Duration>,
}

impl ScriptedGateway {
    fn with_stats(asset: &str, open: f64) -> Self {
        let gateway = Self::default();
        gateway.set_stats(asset, open);
        gateway
    }

    fn set_stats(&self, asset: &str, open: f64) {
        self.stats.lock().unwrap().insert(
            asset.to_string(),
            MarketStats {
                open,
                high: open,
                low: open,
            },
        );
    }

    fn fail_asset(&self, asset: &str) {
        self.failing_assets.lock().unwrap().insert(asset.to_string());
    }

    fn settle(&self, correlation_id: Uuid, executed_value: f64, filled_size: f64, fees: f64) {
        self.fills.lock().unwrap().insert(
            correlation_id,
            OrderFill {
                settled: true,
                executed_value,
                filled_size,
                fees,
            },
        );
    }

    fn orders(&self) -> Vec<OrderRequest> {
        self.orders.lock().unwrap().clone()
    }

    fn is_failing(&self, asset: &str) -> bool {
        self.failing_assets.lock().unwrap().contains(asset)
    }
}

#[async_trait]
impl ExchangeGateway for ScriptedGateway {
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        if self.is_failing(&order.asset_id) {
            return Err(Error::Gateway("connection reset by peer".to_string()));
        }
        self.orders.lock().unwrap().push(order.clone());
        Ok(OrderAck {
            correlation_id: order.correlation_id,
        })
    }

    async fn order_status(&self, correlation_id: Uuid) -> Result<OrderFill> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.status_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .fills
            .lock()
            .unwrap()
            .get(&correlation_id)
            .cloned()
            .unwrap_or(OrderFill {
                settled: false,
                executed_value: 0.0,
                filled_size: 0.0,
                fees: 0.0,
            }))
    }

    async fn market_stats(&self, asset_id: &str) -> Result<MarketStats> {
        if self.is_failing(asset_id) {
            return Err(Error::Gateway("stats unavailable".to_string()));
        }
        self.stats
            .lock()
            .unwrap()
            .get(asset_id)
            .cloned()
            .ok_or_else(|| Error::TransientParse(format!("no stats for {}", asset_id)))
    }
}

/// Management write slipped in between the engine's list and its saves
#[derive(Debug, Clone, Copy)]
enum ConcurrentWrite {
    StopAndTopUp(Uuid),
    TopUp(Uuid),
}

/// Memory store that runs a management write right after `list_jobs`
struct RacingStore {
    inner: Arc<MemoryJobStore>,
    after_list: Mutex<Option<ConcurrentWrite>>,
}

impl RacingStore {
    fn new(inner: Arc<MemoryJobStore>) -> Self {
        Self {
            inner,
            after_list: Mutex::new(None),
        }
    }

    fn arm(&self, write: ConcurrentWrite) {
        *self.after_list.lock().unwrap() = Some(write);
    }
}

#[async_trait]
impl JobStore for RacingStore {
    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let jobs = self.inner.list_jobs().await?;

        let write = self.after_list.lock().unwrap().take();
        let admin = JobAdmin::new(self.inner.clone(), Generation::new());
        match write {
            Some(ConcurrentWrite::StopAndTopUp(job_id)) => {
                admin.stop_job(job_id).await?;
                admin.increase_funds(job_id, 50.0).await?;
            }
            Some(ConcurrentWrite::TopUp(job_id)) => {
                admin.increase_funds(job_id, 50.0).await?;
            }
            None => {}
        }

        Ok(jobs)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.inner.get_job(job_id).await
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        self.inner.save_job(job).await
    }

    async fn update_job(
        &self,
        job_id: Uuid,
        change: &mut (dyn for<'j> FnMut(&'j mut Job) + Send),
    ) -> Result<Option<Job>> {
        self.inner.update_job(job_id, change).await
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        self.inner.delete_job(job_id).await
    }

    async fn list_statuses(&self) -> Result<Vec<JobStatus>> {
        self.inner.list_statuses().await
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        self.inner.get_status(job_id).await
    }

    async fn save_status(&self, status: &JobStatus) -> Result<()> {
        self.inner.save_status(status).await
    }
}

/// Memory store that refuses to mark a job pending while `fail_pending` is set
struct FlakyStore {
    inner: Arc<MemoryJobStore>,
    fail_pending: AtomicBool,
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.inner.list_jobs().await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.inner.get_job(job_id).await
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        self.inner.save_job(job).await
    }

    async fn update_job(
        &self,
        job_id: Uuid,
        change: &mut (dyn for<'j> FnMut(&'j mut Job) + Send),
    ) -> Result<Option<Job>> {
        let Some(mut job) = self.inner.get_job(job_id).await? else {
            return Ok(None);
        };
        let was_pending = job.is_pending;
        change(&mut job);

        if job.is_pending && !was_pending && self.fail_pending.load(Ordering::SeqCst) {
            return Err(Error::Persistence("could not write job row".to_string()));
        }
        self.inner.save_job(&job).await?;
        Ok(Some(job))
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        self.inner.delete_job(job_id).await
    }

    async fn list_statuses(&self) -> Result<Vec<JobStatus>> {
        self.inner.list_statuses().await
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        self.inner.get_status(job_id).await
    }

    async fn save_status(&self, status: &JobStatus) -> Result<()> {
        self.inner.save_status(status).await
    }
}

struct Harness {
    engine: TradingEngine,
    store: Arc<MemoryJobStore>,
    gateway: Arc<ScriptedGateway>,
    feed: Arc<PriceFeed>,
    _commands: UnboundedReceiver<FeedCommand>,
}

impl Harness {
    fn new(gateway: ScriptedGateway) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        Self::with_store(gateway, store.clone(), store)
    }

    /// Engine writes through `engine_store`; assertions read `store` directly
    fn with_store(
        gateway: ScriptedGateway,
        store: Arc<MemoryJobStore>,
        engine_store: Arc<dyn JobStore>,
    ) -> Self {
        let gateway = Arc::new(gateway);
        let (feed, commands) = PriceFeed::new(FeedAggregator::new(3600, 3), Duration::seconds(120));
        let feed = Arc::new(feed);

        let engine = TradingEngine::new(
            engine_store,
            gateway.clone(),
            feed.clone(),
            &Config::default(),
        );

        Self {
            engine,
            store,
            gateway,
            feed,
            _commands: commands,
        }
    }

    async fn insert(&self, job: &Job) {
        self.store.save_job(job).await.unwrap();
    }

    async fn job(&self, job_id: Uuid) -> Option<Job> {
        self.store.get_job(job_id).await.unwrap()
    }

    async fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.store.get_status(job_id).await.unwrap()
    }

    /// Publish a price and run one tick
    async fn tick_at(&mut self, asset: &str, price: f64) -> TickReport {
        self.feed.on_tick(asset, price);
        self.engine.tick().await
    }
}

fn init_job(asset: &str, funds: f64) -> Job {
    let mut job = Job::new(asset, funds, 1.10, Utc::now() + Duration::days(1));
    job.price_precision = 2;
    job
}

/// Job holding 300 units bought for 100.00
fn crest_job(asset: &str) -> Job {
    let mut job = Job::new(asset, 100.0, 1.10, Utc::now() + Duration::days(1));
    job.is_initializing = false;
    job.holding_asset = true;
    job.funds = 0.0;
    job.size = 300.0;
    job.cost_basis = 100.0;
    job.price_precision = 4;
    job
}

#[tokio::test]
async fn test_init_buys_after_dip_reverses() {
    let mut h = Harness::new(ScriptedGateway::with_stats(XLM, 100.0));
    let job = init_job(XLM, 100.0);
    h.insert(&job).await;

    let report = h.tick_at(XLM, 100.0).await;
    assert_eq!(report.orders_submitted, 0);
    assert!(!h.job(job.job_id).await.unwrap().crossed);

    h.tick_at(XLM, 95.0).await;
    let stored = h.job(job.job_id).await.unwrap();
    assert!(stored.crossed);
    assert_eq!(stored.extreme_value, 95.0);

    let report = h.tick_at(XLM, 97.0).await;
    assert_eq!(report.orders_submitted, 1);

    let orders = h.gateway.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].side, OrderSide::Buy);
    assert_eq!(orders[0].funds, Some(100.0));
    assert_eq!(orders[0].size, None);
    assert_eq!(orders[0].correlation_id, job.order_correlation_id);

    let stored = h.job(job.job_id).await.unwrap();
    assert!(stored.is_pending);
    assert!(stored.is_initializing);
    let status = h.status(job.job_id).await.unwrap();
    assert_eq!(status.status, Status::Pending);
    assert_eq!(status.last_price, 97.0);
}

#[tokio::test]
async fn test_crest_sells_after_yield_peak() {
    let mut h = Harness::new(ScriptedGateway::default());
    let job = crest_job(XLM);
    h.insert(&job).await;

    // 0.3892 * 300 * (1 - 0.0149) / 100 ~= 1.1502
    h.tick_at(XLM, 0.3892).await;
    let stored = h.job(job.job_id).await.unwrap();
    assert!(stored.crossed);
    assert!((stored.extreme_value - 1.1502).abs() < 1e-4);
    assert!(h.gateway.orders().is_empty());

    // ~= 1.1201, back below the tracked peak
    let report = h.tick_at(XLM, 0.3790).await;
    assert_eq!(report.orders_submitted, 1);

    let orders = h.gateway.orders();
    assert_eq!(orders[0].side, OrderSide::Sell);
    assert_eq!(orders[0].size, Some(300.0));
    assert_eq!(orders[0].funds, None);
    assert!(h.job(job.job_id).await.unwrap().is_pending);
}

#[tokio::test]
async fn test_trough_buys_back_after_yield_peak() {
    let mut h = Harness::new(ScriptedGateway::default());
    let mut job = Job::new(XLM, 118.21, 1.10, Utc::now() + Duration::days(1));
    job.is_initializing = false;
    job.previous_size = 300.0;
    job.price_precision = 4;
    h.insert(&job).await;

    h.tick_at(XLM, 0.3600).await; // ~1.078, below threshold
    assert!(!h.job(job.job_id).await.unwrap().crossed);

    h.tick_at(XLM, 0.3400).await; // ~1.142, crossed
    h.tick_at(XLM, 0.3300).await; // ~1.176, extended
    let stored = h.job(job.job_id).await.unwrap();
    assert!(stored.crossed);
    assert!(stored.extreme_value > 1.17);
    assert!(h.gateway.orders().is_empty());

    let report = h.tick_at(XLM, 0.3350).await; // ~1.159, reversed
    assert_eq!(report.orders_submitted, 1);
    let orders = h.gateway.orders();
    assert_eq!(orders[0].side, OrderSide::Buy);
    assert_eq!(orders[0].funds, Some(118.21));
}

#[tokio::test]
async fn test_pending_buy_settles_into_holding() {
    let mut h = Harness::new(ScriptedGateway::default());
    let mut job = init_job(XLM, 100.0);
    job.is_pending = true;
    h.insert(&job).await;
    h.gateway.settle(job.order_correlation_id, 101.49, 300.0, 1.49);

    let report = h.engine.tick().await;
    assert_eq!(report.polls_started, 1);

    let flushed = h.engine.flush_polls().await;
    assert_eq!(flushed.settlements_applied, 1);

    let stored = h.job(job.job_id).await.unwrap();
    assert!(stored.holding_asset);
    assert!(!stored.is_pending);
    assert!(!stored.is_initializing);
    assert_eq!(stored.size, 300.0);
    assert_eq!(stored.funds, 0.0);
    assert_eq!(stored.cost_basis, 100.0);
    assert_ne!(stored.order_correlation_id, job.order_correlation_id);

    let status = h.status(job.job_id).await.unwrap();
    assert_eq!(status.status, Status::Running);
    assert_eq!(status.current_value, 100.0);
}

#[tokio::test]
async fn test_expired_job_is_deleted_on_the_following_tick() {
    let mut h = Harness::new(ScriptedGateway::default());
    let mut job = init_job(XLM, 100.0);
    job.expires_at = Utc::now() - Duration::minutes(1);
    h.insert(&job).await;

    let report = h.engine.tick().await;
    assert_eq!(report.deactivated, 1);
    assert_eq!(report.deleted, 0);
    let stored = h.job(job.job_id).await.unwrap();
    assert!(!stored.is_active);
    assert_eq!(h.status(job.job_id).await.unwrap().status, Status::Finished);

    let report = h.engine.tick().await;
    assert_eq!(report.deleted, 1);
    assert!(h.job(job.job_id).await.is_none());
    // Status outlives the job
    assert!(h.status(job.job_id).await.is_some());
}

#[tokio::test]
async fn test_failed_submission_keeps_job_retryable() {
    let gateway = ScriptedGateway::default();
    gateway.fail_asset(XLM);
    let mut h = Harness::new(gateway);

    let mut job = init_job(XLM, 100.0);
    job.force_trade_now = true;
    h.insert(&job).await;

    let report = h.tick_at(XLM, 100.0).await;
    assert_eq!(report.submit_failures, 1);
    assert_eq!(report.orders_submitted, 0);

    let stored = h.job(job.job_id).await.unwrap();
    assert!(stored.is_active);
    assert!(!stored.is_pending);
    assert_ne!(stored.order_correlation_id, job.order_correlation_id);
    assert!(stored.force_trade_now);

    // Next attempt goes out under the fresh id
    h.gateway.failing_assets.lock().unwrap().clear();
    let report = h.tick_at(XLM, 100.0).await;
    assert_eq!(report.orders_submitted, 1);
    assert_eq!(h.gateway.orders()[0].correlation_id, stored.order_correlation_id);
}

#[tokio::test]
async fn test_one_failing_job_does_not_block_others() {
    let gateway = ScriptedGateway::default();
    gateway.fail_asset(BTC);
    let mut h = Harness::new(gateway);

    // No usable baseline for BTC: evaluation fails
    let broken = init_job(BTC, 50.0);
    // Held position with a forced exit
    let mut healthy = crest_job(XLM);
    healthy.force_trade_now = true;
    h.insert(&broken).await;
    h.insert(&healthy).await;

    h.feed.on_tick(BTC, 30_000.0);
    let report = h.tick_at(XLM, 0.35).await;

    assert_eq!(report.failures, 1);
    assert_eq!(report.orders_submitted, 1);
    assert!(h.job(healthy.job_id).await.unwrap().is_pending);
    assert!(!h.job(broken.job_id).await.unwrap().is_pending);
}

#[tokio::test]
async fn test_settlement_applied_once_while_poll_in_flight() {
    let gateway = ScriptedGateway {
        status_delay: Some(std::time::Duration::from_millis(100)),
        ..Default::default()
    };
    let mut h = Harness::new(gateway);

    let mut job = crest_job(XLM);
    job.is_pending = true;
    h.insert(&job).await;
    h.gateway.settle(job.order_correlation_id, 120.0, 300.0, 1.79);

    let first = h.engine.tick().await;
    let second = h.engine.tick().await;
    assert_eq!(first.polls_started, 1);
    assert_eq!(second.polls_started, 0);
    assert_eq!(h.engine.polls_in_flight(), 1);

    let flushed = h.engine.flush_polls().await;
    assert_eq!(flushed.settlements_applied, 1);
    assert_eq!(h.gateway.status_calls.load(Ordering::SeqCst), 1);

    let stored = h.job(job.job_id).await.unwrap();
    assert!(!stored.holding_asset);
    assert_eq!(stored.funds, 118.21);
    assert_eq!(stored.previous_size, 300.0);

    // Job is no longer pending, so nothing is polled again
    let third = h.engine.tick().await;
    assert_eq!(third.polls_started, 0);
    assert_eq!(third.settlements_applied, 0);
}

#[tokio::test]
async fn test_unsettled_poll_leaves_job_pending() {
    let mut h = Harness::new(ScriptedGateway::default());
    let mut job = init_job(XLM, 100.0);
    job.is_pending = true;
    h.insert(&job).await;

    h.engine.tick().await;
    let flushed = h.engine.flush_polls().await;
    assert_eq!(flushed.settlements_applied, 0);
    assert!(h.job(job.job_id).await.unwrap().is_pending);

    // Polled again next tick
    assert_eq!(h.engine.tick().await.polls_started, 1);
}

#[tokio::test]
async fn test_cleanup_deletes_only_inactive_idle_jobs() {
    let mut h = Harness::new(ScriptedGateway::default());

    let mut idle_inactive = init_job(XLM, 100.0);
    idle_inactive.is_active = false;
    let mut pending_inactive = crest_job(XLM);
    pending_inactive.is_active = false;
    pending_inactive.is_pending = true;
    let active = init_job(BTC, 100.0);

    for job in [&idle_inactive, &pending_inactive, &active] {
        h.insert(job).await;
    }

    let report = h.engine.tick().await;

    assert_eq!(report.deleted, 1);
    assert!(h.job(idle_inactive.job_id).await.is_none());
    assert!(h.job(pending_inactive.job_id).await.is_some());
    assert!(h.job(active.job_id).await.is_some());
}

#[tokio::test]
async fn test_deactivation_is_monotonic() {
    let mut h = Harness::new(ScriptedGateway::with_stats(XLM, 100.0));

    // Lifetime target already beaten: 1100 / 100 > 10
    let mut job = init_job(XLM, 1100.0);
    job.starting_funds = 100.0;
    job.is_initializing = false;
    job.previous_size = 300.0;
    job.crossed = true;
    job.extreme_value = 2.0;
    h.insert(&job).await;

    let report = h.tick_at(XLM, 1.0).await;
    assert_eq!(report.deactivated, 1);
    // Not evaluated once inactive and holding cash
    assert_eq!(report.orders_submitted, 0);

    let stored = h.job(job.job_id).await.unwrap();
    assert!(!stored.is_active);

    h.tick_at(XLM, 1.0).await;
    assert!(h.job(job.job_id).await.is_none());
}

#[tokio::test]
async fn test_inactive_job_still_sells_its_position() {
    let mut h = Harness::new(ScriptedGateway::default());
    let mut job = crest_job(XLM);
    job.expires_at = Utc::now() - Duration::minutes(1);
    job.force_trade_now = true;
    h.insert(&job).await;

    let report = h.tick_at(XLM, 0.35).await;

    assert_eq!(report.deactivated, 1);
    assert_eq!(report.orders_submitted, 1);
    let stored = h.job(job.job_id).await.unwrap();
    assert!(!stored.is_active);
    assert!(stored.is_pending);

    h.gateway.settle(stored.order_correlation_id, 105.0, 300.0, 1.56);
    h.engine.tick().await;
    h.engine.flush_polls().await;

    let status = h.status(job.job_id).await.unwrap();
    assert_eq!(status.status, Status::Finished);
    assert_eq!(status.current_funds, 103.44);

    h.engine.tick().await;
    assert!(h.job(job.job_id).await.is_none());
}

#[tokio::test]
async fn test_top_up_while_pending_lands_at_settlement() {
    let mut h = Harness::new(ScriptedGateway::default());
    let admin = JobAdmin::new(h.store.clone(), h.engine.generation());

    let mut job = crest_job(XLM);
    job.is_pending = true;
    h.insert(&job).await;

    let outcome = admin.increase_funds(job.job_id, 50.0).await.unwrap();
    assert_eq!(outcome, TopUp::Deferred { pending_total: 50.0 });

    h.gateway.settle(job.order_correlation_id, 120.0, 300.0, 1.79);
    h.engine.tick().await;
    h.engine.flush_polls().await;

    let stored = h.job(job.job_id).await.unwrap();
    assert_eq!(stored.funds, 168.21);
    assert_eq!(stored.starting_funds, 150.0);
    assert_eq!(stored.pending_funds_increase, 0.0);

    // The buy-back spends a whole-cent amount
    admin.force_trade(job.job_id).await.unwrap();
    let report = h.tick_at(XLM, 0.35).await;
    assert_eq!(report.orders_submitted, 1);
    let orders = h.gateway.orders();
    assert_eq!(orders.last().unwrap().side, OrderSide::Buy);
    assert_eq!(orders.last().unwrap().funds, Some(168.21));
}

#[tokio::test]
async fn test_management_writes_during_a_tick_are_kept() {
    let store = Arc::new(MemoryJobStore::new());
    let racing = Arc::new(RacingStore::new(store.clone()));
    let mut h = Harness::with_store(ScriptedGateway::with_stats(XLM, 100.0), store, racing.clone());

    let job = init_job(XLM, 100.0);
    h.insert(&job).await;
    h.tick_at(XLM, 100.0).await;

    // Stop and top-up land after the engine has read the job, before it saves the crossing
    racing.arm(ConcurrentWrite::StopAndTopUp(job.job_id));
    h.tick_at(XLM, 95.0).await;

    let stored = h.job(job.job_id).await.unwrap();
    assert!(stored.crossed);
    assert_eq!(stored.extreme_value, 95.0);
    assert!(stored.expires_at <= Utc::now());
    assert_eq!(stored.funds, 150.0);
    assert_eq!(stored.starting_funds, 150.0);
    assert_eq!(h.status(job.job_id).await.unwrap().status, Status::Stopped);

    let report = h.engine.tick().await;
    assert_eq!(report.deactivated, 1);
    assert_eq!(h.status(job.job_id).await.unwrap().status, Status::Stopped);
}

#[tokio::test]
async fn test_top_up_racing_a_buy_waits_for_the_next_sell() {
    let store = Arc::new(MemoryJobStore::new());
    let racing = Arc::new(RacingStore::new(store.clone()));
    let mut h = Harness::with_store(ScriptedGateway::with_stats(XLM, 100.0), store, racing.clone());

    let job = init_job(XLM, 100.0);
    h.insert(&job).await;
    h.tick_at(XLM, 100.0).await;
    h.tick_at(XLM, 95.0).await;

    // Top-up applied as idle cash while the engine is about to buy with 100
    racing.arm(ConcurrentWrite::TopUp(job.job_id));
    let report = h.tick_at(XLM, 97.0).await;
    assert_eq!(report.orders_submitted, 1);
    assert_eq!(h.gateway.orders()[0].funds, Some(100.0));

    let stored = h.job(job.job_id).await.unwrap();
    assert!(stored.is_pending);
    assert_eq!(stored.funds, 100.0);
    assert_eq!(stored.starting_funds, 100.0);
    assert_eq!(stored.pending_funds_increase, 50.0);

    h.gateway.settle(job.order_correlation_id, 101.49, 300.0, 1.49);
    h.engine.tick().await;
    h.engine.flush_polls().await;

    let stored = h.job(job.job_id).await.unwrap();
    assert!(stored.holding_asset);
    assert_eq!(stored.cost_basis, 100.0);
    assert_eq!(stored.pending_funds_increase, 50.0);
}

#[tokio::test]
async fn test_accepted_order_is_not_resubmitted_when_save_fails() {
    let store = Arc::new(MemoryJobStore::new());
    let flaky = Arc::new(FlakyStore {
        inner: store.clone(),
        fail_pending: AtomicBool::new(true),
    });
    let mut h = Harness::with_store(ScriptedGateway::with_stats(XLM, 100.0), store, flaky.clone());

    let job = init_job(XLM, 100.0);
    h.insert(&job).await;
    h.tick_at(XLM, 100.0).await;
    h.tick_at(XLM, 95.0).await;

    let report = h.tick_at(XLM, 97.0).await;
    assert_eq!(report.orders_submitted, 1);
    assert_eq!(report.failures, 1);
    assert_eq!(h.engine.unsaved_orders(), 1);
    assert!(!h.job(job.job_id).await.unwrap().is_pending);

    // Still unsaved: the job sits out instead of firing again
    let report = h.tick_at(XLM, 97.5).await;
    assert_eq!(report.orders_submitted, 0);
    assert_eq!(h.gateway.orders().len(), 1);

    flaky.fail_pending.store(false, Ordering::SeqCst);
    let sent = h.gateway.orders()[0].correlation_id;
    h.gateway.settle(sent, 101.49, 300.0, 1.49);

    let report = h.tick_at(XLM, 98.0).await;
    assert_eq!(report.orders_submitted, 0);
    assert_eq!(report.polls_started, 1);
    assert_eq!(h.engine.unsaved_orders(), 0);
    let stored = h.job(job.job_id).await.unwrap();
    assert!(stored.is_pending);
    assert_eq!(stored.order_correlation_id, sent);
    assert_eq!(h.status(job.job_id).await.unwrap().status, Status::Pending);

    h.engine.flush_polls().await;
    let stored = h.job(job.job_id).await.unwrap();
    assert!(stored.holding_asset);
    assert_eq!(h.gateway.orders().len(), 1);
}

#[tokio::test]
async fn test_stopped_job_keeps_stopped_status() {
    let mut h = Harness::new(ScriptedGateway::default());
    let admin = JobAdmin::new(h.store.clone(), h.engine.generation());

    let job = admin
        .create_job(NewJob {
            asset_id: XLM.to_string(),
            funds: 100.0,
            yield_threshold: 1.10,
            total_yield_threshold: 10.0,
            price_precision: 4,
            expires_at: Utc::now() + Duration::days(1),
            protect_stop: false,
            loss_floor: 0.0,
        })
        .await
        .unwrap();
    admin.stop_job(job.job_id).await.unwrap();

    let report = h.engine.tick().await;
    assert_eq!(report.deactivated, 1);
    assert_eq!(h.status(job.job_id).await.unwrap().status, Status::Stopped);

    h.engine.tick().await;
    assert!(h.job(job.job_id).await.is_none());
}

#[tokio::test]
async fn test_protect_stop_exits_underwater_position() {
    let mut h = Harness::new(ScriptedGateway::default());
    let mut job = crest_job(XLM);
    job.protect_stop = true;
    job.loss_floor = 0.9;
    h.insert(&job).await;

    // Break-even is 0.3333; yield at 0.28 is ~0.83
    let report = h.tick_at(XLM, 0.28).await;

    assert_eq!(report.orders_submitted, 1);
    assert_eq!(h.gateway.orders()[0].side, OrderSide::Sell);
    let stored = h.job(job.job_id).await.unwrap();
    assert!(stored.is_pending);
    assert!(!stored.is_active);
}

#[tokio::test]
async fn test_protect_stop_ignored_above_loss_floor() {
    let mut h = Harness::new(ScriptedGateway::default());
    let mut job = crest_job(XLM);
    job.protect_stop = true;
    job.loss_floor = 0.5;
    h.insert(&job).await;

    let report = h.tick_at(XLM, 0.28).await;

    assert_eq!(report.orders_submitted, 0);
    assert!(h.job(job.job_id).await.unwrap().is_active);
}

#[tokio::test]
async fn test_tick_tracks_subscriptions_and_generation() {
    let mut h = Harness::new(ScriptedGateway::with_stats(XLM, 100.0));
    let generation = h.engine.generation();
    let job = init_job(XLM, 100.0);
    h.insert(&job).await;

    let seen = generation.current();
    h.tick_at(XLM, 100.0).await;
    assert_eq!(h.feed.subscriptions(), vec![XLM.to_string()]);
    // Nothing crossed, nothing persisted
    assert!(!generation.changed_since(seen));

    h.tick_at(XLM, 95.0).await;
    assert!(generation.changed_since(seen));
}

#[tokio::test]
async fn test_jobs_without_price_are_skipped() {
    let mut h = Harness::new(ScriptedGateway::with_stats(XLM, 100.0));
    let mut job = init_job(XLM, 100.0);
    job.force_trade_now = true;
    h.insert(&job).await;

    let report = h.engine.tick().await;

    assert_eq!(report.orders_submitted, 0);
    assert_eq!(report.failures, 0);
    assert!(!h.job(job.job_id).await.unwrap().is_pending);
}

#[tokio::test]
async fn test_run_until_flushes_outstanding_polls() {
    let h = Harness::new(ScriptedGateway::default());
    let mut job = init_job(XLM, 100.0);
    job.is_pending = true;
    h.insert(&job).await;
    h.gateway.settle(job.order_correlation_id, 101.49, 300.0, 1.49);

    let store = h.store.clone();
    let report = h
        .engine
        .run_until(tokio::time::sleep(std::time::Duration::from_millis(50)))
        .await;

    assert_eq!(report.settlements_applied, 1);
    assert!(store.get_job(job.job_id).await.unwrap().unwrap().holding_asset);
}
