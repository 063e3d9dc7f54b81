//! Job storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use pulse_core::TenantId;

use super::types::{DeadLetterEntry, Job, JobId, JobStatus};

/// Job store abstraction. Claiming is FIFO over ready jobs.
pub trait JobStore: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the oldest ready job (pending, or failed with elapsed backoff),
    /// marking it running. `None` when nothing is ready.
    fn claim_next(&self, tenant_id: Option<TenantId>) -> Result<Option<Job>, JobStoreError>;

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError>;

    fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Move a dead-lettered job back to pending with a clean slate.
    fn retry_dead_letter(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobStoreError>;

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub cancelled: usize,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn jobs_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn jobs_read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs_write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs_read()?;
        match jobs.get(&job_id) {
            Some(job) if job.tenant_id == tenant_id => Ok(Some(job.clone())),
            Some(_) => Err(JobStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs_write()?;
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn claim_next(&self, tenant_id: Option<TenantId>) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs_write()?;

        let mut candidates: Vec<_> = jobs
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Pending | JobStatus::Failed { .. })
                    && j.is_ready()
                    && tenant_id.is_none_or(|t| j.tenant_id == t)
            })
            .map(|j| (j.created_at, j.id))
            .collect();
        candidates.sort_by_key(|(created_at, _)| *created_at);

        if let Some((_, id)) = candidates.first() {
            if let Some(job) = jobs.get_mut(id) {
                job.mark_running();
                return Ok(Some(job.clone()));
            }
        }

        Ok(None)
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs_read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.tenant_id == tenant_id
                    && status.as_ref().is_none_or(|s| {
                        std::mem::discriminant(&j.status) == std::mem::discriminant(s)
                    })
            })
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }

    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs_write()?;
        let mut dls = self
            .dead_letters
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))?;

        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
            attempts: job.attempt,
        };
        job.updated_at = Utc::now();

        jobs.remove(&job.id);
        dls.insert(job.id, DeadLetterEntry::new(job, reason));

        Ok(())
    }

    fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let dls = self
            .dead_letters
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))?;
        let mut result: Vec<_> = dls
            .values()
            .filter(|e| e.job.tenant_id == tenant_id)
            .cloned()
            .collect();

        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs_write()?;
        let mut dls = self
            .dead_letters
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))?;

        let entry = dls.remove(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        if entry.job.tenant_id != tenant_id {
            dls.insert(job_id, entry);
            return Err(JobStoreError::TenantIsolation);
        }

        let mut job = entry.job;
        job.status = JobStatus::Pending;
        job.attempt = 0;
        job.scheduled_at = None;
        job.updated_at = Utc::now();
        job.history.clear();

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs_read()?;
        let dls = self
            .dead_letters
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))?;

        let mut stats = JobStats::default();

        for job in jobs.values() {
            if job.tenant_id != tenant_id {
                continue;
            }
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }

        stats.dead_lettered += dls
            .values()
            .filter(|e| e.job.tenant_id == tenant_id)
            .count();

        Ok(stats)
    }
}

impl JobStore for Arc<InMemoryJobStore> {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(tenant_id, job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self, tenant_id: Option<TenantId>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(tenant_id)
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(tenant_id, status, limit)
    }

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError> {
        (**self).dead_letter(job, reason)
    }

    fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(tenant_id, limit)
    }

    fn retry_dead_letter(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).retry_dead_letter(tenant_id, job_id)
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        (**self).stats(tenant_id)
    }
}
