use anyhow::{bail, Context};
use autotrader::api::CoinbaseGateway;
use autotrader::feed::{FeedAggregator, TickerConnection};
use autotrader::persistence::RedisGenerationMirror;
use autotrader::store::{MemoryJobStore, PostgresJobStore};
use autotrader::{Config, Generation, JobAdmin, JobStatus, JobStore, NewJob, PriceFeed, TradingEngine};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "autotrader", about = "Trailing-threshold trading engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine and the ticker feed until Ctrl-C
    Run,
    /// Create a job that starts by buying `funds` worth of the asset
    CreateJob {
        /// Exchange product id, e.g. XLM-USD
        #[arg(long)]
        asset: String,
        #[arg(long)]
        funds: f64,
        /// Per-cycle yield target, e.g. 1.10
        #[arg(long, default_value_t = 1.10)]
        yield_threshold: f64,
        /// Lifetime cash multiple at which the job retires
        #[arg(long, default_value_t = 10.0)]
        total_yield_threshold: f64,
        /// Decimal places the exchange quotes this asset in
        #[arg(long, default_value_t = 2)]
        price_precision: u32,
        #[arg(long, default_value_t = 30)]
        days: i64,
        /// Sell out early when the position is underwater
        #[arg(long)]
        protect_stop: bool,
        #[arg(long, default_value_t = 0.9)]
        loss_floor: f64,
    },
    /// Expire a job; the engine retires it on its next tick
    StopJob { job_id: Uuid },
    /// Add funds to a job (deferred while an order is in flight)
    TopUp { job_id: Uuid, amount: f64 },
    /// Trade on the next tick regardless of trailing state
    ForceTrade { job_id: Uuid },
    /// Print job statuses
    Status { job_id: Option<Uuid> },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;

    let mut mirror = connect_mirror(&config).await;
    // Counts this process's mutations; the mirror adds them to the shared counter
    let generation = Generation::new();
    if let Some(mirror) = mirror.as_mut() {
        match mirror.load_generation().await {
            Ok(shared) => tracing::info!(shared = shared.unwrap_or(0), "Shared generation"),
            Err(e) => tracing::warn!("Failed to read generation from Redis: {}", e),
        }
    }

    let store = open_store(&config, matches!(cli.command, Command::Run)).await?;

    match cli.command {
        Command::Run => run(config, store, generation, mirror).await,
        command => {
            let admin = JobAdmin::new(store, generation.clone());
            manage(&admin, command).await?;

            let changes = generation.current();
            if let Some(mirror) = mirror.as_mut().filter(|_| changes > 0) {
                if let Err(e) = mirror.publish_changes(changes).await {
                    tracing::warn!("Failed to publish generation: {}", e);
                }
            }
            Ok(())
        }
    }
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("autotrader=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_store(config: &Config, running: bool) -> anyhow::Result<Arc<dyn JobStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresJobStore::new(url)
                .await
                .context("Failed to connect to Postgres")?;
            Ok(Arc::new(store))
        }
        None if running => {
            tracing::warn!("AUTOTRADER_DATABASE_URL not set; jobs live in memory only");
            Ok(Arc::new(MemoryJobStore::new()))
        }
        None => bail!("AUTOTRADER_DATABASE_URL is required to manage jobs"),
    }
}

async fn connect_mirror(config: &Config) -> Option<RedisGenerationMirror> {
    let url = config.redis_url.as_deref()?;

    match RedisGenerationMirror::new(url).await {
        Ok(mirror) => Some(mirror),
        Err(e) => {
            tracing::warn!("Redis unavailable, generation mirror disabled: {}", e);
            None
        }
    }
}

async fn run(
    config: Config,
    store: Arc<dyn JobStore>,
    generation: Generation,
    mirror: Option<RedisGenerationMirror>,
) -> anyhow::Result<()> {
    tracing::info!("autotrader starting");

    // Missing credentials are fatal here and nowhere else
    let credentials = config.credentials()?;
    let gateway = CoinbaseGateway::new(
        config.api_url.clone(),
        &credentials,
        config.rate_limit_per_sec,
        config.request_timeout(),
    )?;

    let aggregator = FeedAggregator::new(config.bucket_secs, config.bucket_count);
    let (feed, commands) = PriceFeed::new(aggregator, Duration::seconds(config.price_stale_after_secs));
    let feed = Arc::new(feed);

    let ticker = TickerConnection::new(config.ws_url.clone(), Arc::clone(&feed), commands);
    let ticker_handle = tokio::spawn(ticker.run());

    let mirror_handle = mirror.map(|mirror| {
        let store = Arc::clone(&store);
        tokio::spawn(mirror.run(generation.clone(), config.tick_interval(), move || {
            let store = Arc::clone(&store);
            async move { store.list_statuses().await }
        }))
    });

    tracing::info!(
        tick_secs = config.tick_interval_secs,
        fee_rate = config.fee_rate,
        api = %config.api_url,
        "Configuration loaded"
    );

    let engine = TradingEngine::new(store, Arc::new(gateway), feed, &config).with_generation(generation);
    engine.run().await;

    ticker_handle.abort();
    if let Some(handle) = mirror_handle {
        handle.abort();
    }

    tracing::info!("autotrader stopped");
    Ok(())
}

async fn manage(admin: &JobAdmin, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run => bail!("run is not a management command"),
        Command::CreateJob {
            asset,
            funds,
            yield_threshold,
            total_yield_threshold,
            price_precision,
            days,
            protect_stop,
            loss_floor,
        } => {
            let job = admin
                .create_job(NewJob {
                    asset_id: asset,
                    funds,
                    yield_threshold,
                    total_yield_threshold,
                    price_precision,
                    expires_at: Utc::now() + Duration::days(days),
                    protect_stop,
                    loss_floor,
                })
                .await?;
            println!("Created job {} for {}", job.job_id, job.asset_id);
        }
        Command::StopJob { job_id } => {
            admin.stop_job(job_id).await?;
            println!("Stopped job {}", job_id);
        }
        Command::TopUp { job_id, amount } => {
            let outcome = admin.increase_funds(job_id, amount).await?;
            println!("Job {}: {:?}", job_id, outcome);
        }
        Command::ForceTrade { job_id } => {
            let job = admin.force_trade(job_id).await?;
            println!("Job {} will {:?} on the next tick", job_id, job.next_side());
        }
        Command::Status { job_id } => {
            let statuses = match job_id {
                Some(id) => vec![admin.status(id).await?],
                None => admin.statuses().await?,
            };
            print_statuses(&statuses);
        }
    }
    Ok(())
}

fn print_statuses(statuses: &[JobStatus]) {
    if statuses.is_empty() {
        println!("No jobs");
        return;
    }

    println!(
        "{:<36}  {:<8}  {:>12}  {:>12}  {:>12}  {:>12}",
        "JOB", "STATUS", "STARTING", "CURRENT", "GAIN/LOSS", "LAST PRICE"
    );
    for s in statuses {
        println!(
            "{:<36}  {:<8}  {:>12.2}  {:>12.2}  {:>12.2}  {:>12}",
            s.job_id,
            s.status.as_str(),
            s.starting_funds,
            s.current_value,
            s.gains_losses,
            s.last_price
        );
    }
}
