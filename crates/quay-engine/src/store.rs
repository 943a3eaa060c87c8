//! Job record storage
//!
//! Records are in-memory by design; durability of the outcome belongs to
//! whoever receives the public URL. The store is the single writer gate
//! for status transitions: `update_status` only accepts writes that move
//! the forward walk strictly onward, which is what makes `start`
//! idempotent and the terminal event unique.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quay_core::{Job, JobId, JobStatus, QuayError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<()>;

    async fn get(&self, id: &JobId) -> Result<Job>;

    /// Apply `status` iff it strictly advances the walk. Returns whether
    /// the write was accepted; backward and post-terminal writes are
    /// refused, not errors.
    async fn update_status(&self, id: &JobId, status: JobStatus) -> Result<bool>;

    async fn set_workdir(&self, id: &JobId, workdir: PathBuf) -> Result<()>;

    async fn set_public_url(&self, id: &JobId, url: String) -> Result<()>;

    async fn set_error(&self, id: &JobId, error: String) -> Result<()>;

    /// Remove terminal records last touched before `cutoff`, returning them
    async fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;
}

/// The in-process store used by the server and by tests
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(QuayError::Other(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Job> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| QuayError::JobNotFound(id.to_string()))
    }

    async fn update_status(&self, id: &JobId, status: JobStatus) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QuayError::JobNotFound(id.to_string()))?;
        if status.phase_rank() <= job.status.phase_rank() {
            return Ok(false);
        }
        job.status = status;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_workdir(&self, id: &JobId, workdir: PathBuf) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QuayError::JobNotFound(id.to_string()))?;
        job.workdir = Some(workdir);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn set_public_url(&self, id: &JobId, url: String) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QuayError::JobNotFound(id.to_string()))?;
        job.public_url = Some(url);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn set_error(&self, id: &JobId, error: String) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QuayError::JobNotFound(id.to_string()))?;
        job.error = Some(error);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut jobs = self.jobs.write().await;
        let expired: Vec<JobId> = jobs
            .values()
            .filter(|job| job.status.is_terminal() && job.updated_at < cutoff)
            .map(|job| job.id)
            .collect();
        let mut evicted = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(job) = jobs.remove(&id) {
                evicted.push(job);
            }
        }
        Ok(evicted)
    }
}
