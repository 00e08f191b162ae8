//! Job store abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use portal_core::{ApplicationId, JobId, SchemaId};

use super::types::{Job, JobStatus, JobType, JobUpdate};

/// Persistence for outbox jobs.
///
/// The store holds no business rules: the dispatcher computes a
/// [`JobUpdate`] and the store writes exactly those columns.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job on its own (outside any entity transaction).
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Jobs originating from a schema, oldest first.
    async fn find_by_schema(&self, schema_id: SchemaId) -> Result<Vec<Job>, JobStoreError>;

    /// Jobs originating from an application, oldest first.
    async fn find_by_application(
        &self,
        application_id: ApplicationId,
    ) -> Result<Vec<Job>, JobStoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// Write the bookkeeping columns of one job.
    async fn update(&self, job_id: JobId, update: &JobUpdate) -> Result<(), JobStoreError>;

    /// Atomically move up to `limit` ready jobs from `pending` to `processing`
    /// and return them, oldest-created first. Jobs claimed by a concurrent
    /// caller are skipped rather than waited on.
    async fn claim_batch(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Reset jobs stuck in `processing` since before `stale_before` to
    /// `pending`. Returns how many were reset.
    async fn recover_stuck(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn find_by_schema(&self, schema_id: SchemaId) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_by_schema(schema_id).await
    }

    async fn find_by_application(
        &self,
        application_id: ApplicationId,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_by_application(application_id).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(filter).await
    }

    async fn update(&self, job_id: JobId, update: &JobUpdate) -> Result<(), JobStoreError> {
        (**self).update(job_id, update).await
    }

    async fn claim_batch(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).claim_batch(now, limit).await
    }

    async fn recover_stuck(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        (**self).recover_stuck(stale_before, now).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Criteria for [`JobStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| s == job.status) && self.job_type.is_none_or(|t| t == job.job_type)
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub compensated: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Compensated => self.compensated += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.compensated
    }
}
