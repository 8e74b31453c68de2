// Durable job storage and the change counter caches watch
pub mod memory;
pub mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{Job, JobStatus};
use crate::Result;

/// CRUD over jobs and their reporting status, keyed by job id
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn list_jobs(&self) -> Result<Vec<Job>>;
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>>;
    async fn save_job(&self, job: &Job) -> Result<()>;
    /// Read-modify-write one job atomically; `None` if it no longer exists
    ///
    /// Writers that only own some fields go through here so a concurrent
    /// writer's fields survive.
    async fn update_job(
        &self,
        job_id: Uuid,
        change: &mut (dyn for<'j> FnMut(&'j mut Job) + Send),
    ) -> Result<Option<Job>>;
    async fn delete_job(&self, job_id: Uuid) -> Result<()>;
    async fn list_statuses(&self) -> Result<Vec<JobStatus>>;
    async fn get_status(&self, job_id: Uuid) -> Result<Option<JobStatus>>;
    async fn save_status(&self, status: &JobStatus) -> Result<()>;
}

/// Monotonic change counter, bumped on every job mutation
///
/// Readers that cache job data remember the value they loaded at and
/// reload once it moves.
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mutation; returns the new generation
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn changed_since(&self, seen: u64) -> bool {
        self.current() != seen
    }
}
