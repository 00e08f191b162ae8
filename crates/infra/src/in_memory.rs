//! In-memory job and entity store for tests/dev.
//!
//! One mutex guards jobs and entities together, so the outbox co-insert and
//! the claim are atomic in the same way a database transaction is. Counted
//! fault injection ([`FailPoint`]) lets tests exercise rollback and error
//! paths.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use portal_core::{ApplicationId, JobId, SchemaId};

use crate::entities::{Application, EntityStore, EntityStoreError, Schema};
use crate::jobs::{Job, JobFilter, JobStats, JobStatus, JobStore, JobStoreError, JobUpdate};

/// Operation that fails the next time(s) it is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    EntityInsert,
    EntityDelete,
    JobInsert,
    JobUpdate,
    Claim,
    Sweep,
}

fn by_created<'a>(jobs: impl Iterator<Item = &'a Job>) -> Vec<Job> {
    let mut out: Vec<Job> = jobs.cloned().collect();
    out.sort_by_key(|j| (j.created_at, *j.id.as_uuid()));
    out
}

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    schemas: HashMap<SchemaId, Schema>,
    applications: HashMap<ApplicationId, Application>,
    armed: HashMap<FailPoint, u32>,
}

impl Tables {
    fn trip(&mut self, point: FailPoint) -> bool {
        match self.armed.get_mut(&point) {
            Some(n) if *n > 1 => {
                *n -= 1;
                true
            }
            Some(_) => self.armed.remove(&point).is_some(),
            None => false,
        }
    }

    fn insert_job(&mut self, job: &Job) -> Result<(), JobStoreError> {
        if self.trip(FailPoint::JobInsert) {
            return Err(JobStoreError::Storage("injected job insert failure".into()));
        }
        if self.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn check_entity_insert(&mut self) -> Result<(), EntityStoreError> {
        if self.trip(FailPoint::EntityInsert) {
            return Err(EntityStoreError::Storage("injected entity insert failure".into()));
        }
        Ok(())
    }

    fn check_entity_delete(&mut self) -> Result<(), EntityStoreError> {
        if self.trip(FailPoint::EntityDelete) {
            return Err(EntityStoreError::Storage("injected entity delete failure".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPortalStore {
    inner: Mutex<Tables>,
}

impl InMemoryPortalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `point` operation fail.
    pub fn fail_next(&self, point: FailPoint) {
        self.fail_times(point, 1);
    }

    /// Make the next `times` attempts at `point` fail.
    pub fn fail_times(&self, point: FailPoint, times: u32) {
        if times == 0 {
            return;
        }
        *self
            .inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .armed
            .entry(point)
            .or_default() += times;
    }

    pub fn schema_count(&self) -> usize {
        self.inner.lock().map(|t| t.schemas.len()).unwrap_or(0)
    }

    pub fn application_count(&self) -> usize {
        self.inner.lock().map(|t| t.applications.len()).unwrap_or(0)
    }

    pub fn job_count(&self) -> usize {
        self.inner.lock().map(|t| t.jobs.len()).unwrap_or(0)
    }

    /// Force a job's fields, bypassing the state machine. For simulating a
    /// crashed worker or aged rows.
    pub fn overwrite_job(&self, job: Job) {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .jobs
            .insert(job.id, job);
    }

    fn jobs(&self) -> Result<MutexGuard<'_, Tables>, JobStoreError> {
        self.inner
            .lock()
            .map_err(|_| JobStoreError::Storage("in-memory store lock poisoned".into()))
    }

    fn entities(&self) -> Result<MutexGuard<'_, Tables>, EntityStoreError> {
        self.inner
            .lock()
            .map_err(|_| EntityStoreError::Storage("in-memory store lock poisoned".into()))
    }
}

#[async_trait]
impl JobStore for InMemoryPortalStore {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        self.jobs()?.insert_job(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs()?.jobs.get(&job_id).cloned())
    }

    async fn find_by_schema(&self, schema_id: SchemaId) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.jobs()?;
        Ok(by_created(tables.jobs.values().filter(|j| j.schema_id == Some(schema_id))))
    }

    async fn find_by_application(
        &self,
        application_id: ApplicationId,
    ) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.jobs()?;
        Ok(by_created(
            tables
                .jobs
                .values()
                .filter(|j| j.application_id == Some(application_id)),
        ))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.jobs()?;
        let mut jobs = by_created(tables.jobs.values().filter(|j| filter.matches(j)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn update(&self, job_id: JobId, update: &JobUpdate) -> Result<(), JobStoreError> {
        let mut tables = self.jobs()?;
        if tables.trip(FailPoint::JobUpdate) {
            return Err(JobStoreError::Storage("injected job update failure".into()));
        }
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        job.apply(update);
        Ok(())
    }

    async fn claim_batch(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut tables = self.jobs()?;
        if tables.trip(FailPoint::Claim) {
            return Err(JobStoreError::Storage("injected claim failure".into()));
        }

        let mut ready = by_created(tables.jobs.values().filter(|j| j.is_ready(now)));
        ready.truncate(limit);

        for job in &mut ready {
            job.status = JobStatus::Processing;
            job.updated_at = now;
            tables.jobs.insert(job.id, job.clone());
        }
        Ok(ready)
    }

    async fn recover_stuck(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let mut tables = self.jobs()?;
        if tables.trip(FailPoint::Sweep) {
            return Err(JobStoreError::Storage("injected sweep failure".into()));
        }

        let mut recovered = 0;
        for job in tables.jobs.values_mut() {
            if job.status == JobStatus::Processing && job.updated_at < stale_before {
                job.status = JobStatus::Pending;
                job.updated_at = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let tables = self.jobs()?;
        let mut stats = JobStats::default();
        for job in tables.jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl EntityStore for InMemoryPortalStore {
    async fn insert_schema(&self, schema: &Schema) -> Result<(), EntityStoreError> {
        let mut tables = self.entities()?;
        tables.check_entity_insert()?;
        if tables.schemas.contains_key(&schema.id) {
            return Err(EntityStoreError::Conflict {
                entity: "schema",
                id: schema.id.to_string(),
            });
        }
        tables.schemas.insert(schema.id, schema.clone());
        Ok(())
    }

    async fn insert_schema_with_job(&self, schema: &Schema, job: &Job) -> Result<(), EntityStoreError> {
        let mut tables = self.entities()?;
        tables.check_entity_insert()?;
        if tables.schemas.contains_key(&schema.id) {
            return Err(EntityStoreError::Conflict {
                entity: "schema",
                id: schema.id.to_string(),
            });
        }
        // Job first: if it fails, the schema was never written.
        tables.insert_job(job)?;
        tables.schemas.insert(schema.id, schema.clone());
        Ok(())
    }

    async fn get_schema(&self, id: SchemaId) -> Result<Option<Schema>, EntityStoreError> {
        Ok(self.entities()?.schemas.get(&id).cloned())
    }

    async fn delete_schema(&self, id: SchemaId) -> Result<(), EntityStoreError> {
        let mut tables = self.entities()?;
        tables.check_entity_delete()?;
        tables
            .schemas
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| EntityStoreError::schema_not_found(id))
    }

    async fn insert_application(&self, application: &Application) -> Result<(), EntityStoreError> {
        let mut tables = self.entities()?;
        tables.check_entity_insert()?;
        if tables.applications.contains_key(&application.id) {
            return Err(EntityStoreError::Conflict {
                entity: "application",
                id: application.id.to_string(),
            });
        }
        tables.applications.insert(application.id, application.clone());
        Ok(())
    }

    async fn insert_application_with_job(
        &self,
        application: &Application,
        job: &Job,
    ) -> Result<(), EntityStoreError> {
        let mut tables = self.entities()?;
        tables.check_entity_insert()?;
        if tables.applications.contains_key(&application.id) {
            return Err(EntityStoreError::Conflict {
                entity: "application",
                id: application.id.to_string(),
            });
        }
        tables.insert_job(job)?;
        tables.applications.insert(application.id, application.clone());
        Ok(())
    }

    async fn get_application(&self, id: ApplicationId) -> Result<Option<Application>, EntityStoreError> {
        Ok(self.entities()?.applications.get(&id).cloned())
    }

    async fn delete_application(&self, id: ApplicationId) -> Result<(), EntityStoreError> {
        let mut tables = self.entities()?;
        tables.check_entity_delete()?;
        tables
            .applications
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| EntityStoreError::application_not_found(id))
    }
}
