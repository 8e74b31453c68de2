use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::JobStore;
use crate::models::{Job, JobStatus};
use crate::Result;

/// In-process store used when no database is configured, and in tests
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    statuses: RwLock<HashMap<Uuid, JobStatus>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        // Stable order keeps tick logs readable
        jobs.sort_by_key(|j| j.job_id);
        Ok(jobs)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        self.jobs.write().await.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn update_job(
        &self,
        job_id: Uuid,
        change: &mut (dyn for<'j> FnMut(&'j mut Job) + Send),
    ) -> Result<Option<Job>> {
        let mut jobs = self.jobs.write().await;
        Ok(jobs.get_mut(&job_id).map(|job| {
            change(job);
            job.clone()
        }))
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        self.jobs.write().await.remove(&job_id);
        Ok(())
    }

    async fn list_statuses(&self) -> Result<Vec<JobStatus>> {
        let mut statuses: Vec<JobStatus> = self.statuses.read().await.values().cloned().collect();
        statuses.sort_by_key(|s| s.job_id);
        Ok(statuses)
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        Ok(self.statuses.read().await.get(&job_id).cloned())
    }

    async fn save_status(&self, status: &JobStatus) -> Result<()> {
        self.statuses
            .write()
            .await
            .insert(status.job_id, status.clone());
        Ok(())
    }
}
