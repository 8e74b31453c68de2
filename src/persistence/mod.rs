use crate::models::JobStatus;
use crate::store::Generation;
use crate::{Error, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration, MissedTickBehavior};

const GENERATION_KEY: &str = "autotrader:generation";
const STATUS_KEY: &str = "autotrader:statuses";

/// Shares the job generation counter and status rows through Redis
///
/// Each process counts its own job mutations and adds them to
/// `autotrader:generation` with `INCRBY`, so the shared value moves on
/// every mutation no matter which process made it. Out-of-process readers
/// (dashboards, the admin CLI on another host) poll it and only reload job
/// data when it moves.
pub struct RedisGenerationMirror {
    conn: ConnectionManager,
}

impl RedisGenerationMirror {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| Error::Timeout("redis connect"))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    /// Current shared generation, if anything was ever published
    pub async fn load_generation(&mut self) -> Result<Option<u64>> {
        let value: Option<u64> = self.conn.get(GENERATION_KEY).await?;
        Ok(value)
    }

    /// Add `changes` local mutations to the shared counter; returns its new value
    pub async fn publish_changes(&mut self, changes: u64) -> Result<u64> {
        let shared: u64 = self.conn.incr(GENERATION_KEY, changes).await?;

        tracing::debug!(changes, shared, "Published generation to Redis");

        Ok(shared)
    }

    /// Store status rows in a hash keyed by job id
    pub async fn publish_statuses(&mut self, statuses: &[JobStatus]) -> Result<()> {
        for status in statuses {
            let value = serde_json::to_string(status)?;
            self.conn
                .hset::<_, _, _, ()>(STATUS_KEY, status.job_id.to_string(), value)
                .await?;
        }
        Ok(())
    }

    pub async fn load_status(&mut self, job_id: uuid::Uuid) -> Result<Option<JobStatus>> {
        let value: Option<String> = self.conn.hget(STATUS_KEY, job_id.to_string()).await?;
        value
            .map(|v| serde_json::from_str(&v).map_err(Error::from))
            .transpose()
    }

    /// Publish whenever the counter moves, until the task is dropped
    pub async fn run<F, Fut>(mut self, generation: Generation, every: Duration, mut statuses: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<JobStatus>>>,
    {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut published = generation.current();
        let mut statuses_stale = true;

        loop {
            ticker.tick().await;

            let current = generation.current();
            if current > published {
                match self.publish_changes(current - published).await {
                    Ok(_) => {
                        published = current;
                        statuses_stale = true;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to publish generation {}: {}", current, e);
                        continue;
                    }
                }
            }

            if !statuses_stale {
                continue;
            }

            match statuses().await {
                Ok(rows) => match self.publish_statuses(&rows).await {
                    Ok(()) => statuses_stale = false,
                    Err(e) => tracing::warn!("Failed to publish job statuses: {}", e),
                },
                Err(e) => tracing::warn!("Failed to read job statuses for mirror: {}", e),
            }
        }
    }
}
