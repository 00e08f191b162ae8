//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_batch` runs one transaction:
//! 1. `SELECT ... FOR UPDATE SKIP LOCKED` the oldest ready `pending` rows
//! 2. `UPDATE` those rows to `processing`
//! 3. commit
//!
//! Rows locked by a concurrent claimer are skipped, so two dispatchers never
//! receive the same job and neither waits on the other.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use async_trait::async_trait;
use portal_core::{ApplicationId, JobId, SchemaId};

use super::store::{JobFilter, JobStats, JobStore, JobStoreError};
use super::types::{Job, JobStatus, JobType, JobUpdate};

const JOB_COLUMNS: &str = r#"
    job_id, job_type, status, schema_id, sdl, application_id, selected_fields,
    grant_duration, retry_count, max_retries, next_retry_at, error,
    processed_at, created_at, updated_at
"#;

/// Job store over the `pdp_jobs` table.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Insert a job inside a caller-owned transaction.
///
/// Entity stores call this so the entity row and its job commit together.
pub async fn insert_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        INSERT INTO pdp_jobs (
            job_id, job_type, status, schema_id, sdl, application_id,
            selected_fields, grant_duration, retry_count, max_retries,
            next_retry_at, error, processed_at, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.job_type.as_str())
    .bind(job.status.as_str())
    .bind(job.schema_id.map(Uuid::from))
    .bind(job.sdl.as_deref())
    .bind(job.application_id.map(Uuid::from))
    .bind(job.selected_fields.as_deref())
    .bind(job.grant_duration.as_deref())
    .bind(job.retry_count as i32)
    .bind(job.max_retries as i32)
    .bind(job.next_retry_at)
    .bind(job.error.as_deref())
    .bind(job.processed_at)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            JobStoreError::AlreadyExists(job.id)
        } else {
            map_sqlx_error("insert_job", e)
        }
    })?;

    Ok(())
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Serialization(format!("failed to decode job row: {e}")))
        .and_then(Job::try_from)
}

fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Job>, JobStoreError> {
    rows.iter().map(decode_row).collect()
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        insert_job(&mut tx, job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM pdp_jobs WHERE job_id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|r| decode_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(schema_id = %schema_id), err)]
    async fn find_by_schema(&self, schema_id: SchemaId) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM pdp_jobs WHERE schema_id = $1 ORDER BY created_at ASC"
        ))
        .bind(schema_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_schema", e))?;

        decode_rows(rows)
    }

    #[instrument(skip(self), fields(application_id = %application_id), err)]
    async fn find_by_application(
        &self,
        application_id: ApplicationId,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM pdp_jobs WHERE application_id = $1 ORDER BY created_at ASC"
        ))
        .bind(application_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_application", e))?;

        decode_rows(rows)
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        // LIMIT NULL means no limit in Postgres.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM pdp_jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR job_type = $2)
            ORDER BY created_at ASC
            LIMIT $3
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.job_type.map(|t| t.as_str()))
        .bind(filter.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        decode_rows(rows)
    }

    #[instrument(skip(self, update), fields(job_id = %job_id, status = %update.status), err)]
    async fn update(&self, job_id: JobId, update: &JobUpdate) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pdp_jobs
            SET status = $2,
                retry_count = $3,
                next_retry_at = $4,
                error = $5,
                processed_at = $6,
                updated_at = $7
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(update.status.as_str())
        .bind(update.retry_count as i32)
        .bind(update.next_retry_at)
        .bind(update.error.as_deref())
        .bind(update.processed_at)
        .bind(update.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn claim_batch(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM pdp_jobs
            WHERE status = 'pending'
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
            ORDER BY created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_select", e))?;

        let mut jobs = decode_rows(rows)?;
        if jobs.is_empty() {
            // Nothing ready; dropping the transaction rolls it back.
            return Ok(jobs);
        }

        let ids: Vec<Uuid> = jobs.iter().map(|j| *j.id.as_uuid()).collect();
        sqlx::query(
            r#"
            UPDATE pdp_jobs
            SET status = 'processing', updated_at = $1
            WHERE job_id = ANY($2)
            "#,
        )
        .bind(now)
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_mark_processing", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        for job in &mut jobs {
            job.status = JobStatus::Processing;
            job.updated_at = now;
        }

        debug!(claimed = jobs.len(), "claimed pending jobs");
        Ok(jobs)
    }

    #[instrument(skip(self), err)]
    async fn recover_stuck(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pdp_jobs
            SET status = 'pending', updated_at = $2
            WHERE status = 'processing' AND updated_at < $1
            "#,
        )
        .bind(stale_before)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_stuck", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM pdp_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Serialization(e.to_string()))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| JobStoreError::Serialization(e.to_string()))?;
            let status: JobStatus = status.parse().map_err(JobStoreError::Serialization)?;
            stats.record(status, count.max(0) as u64);
        }
        Ok(stats)
    }
}

/// Map SQLx errors to JobStoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[derive(Debug)]
struct JobRow {
    job_id: Uuid,
    job_type: String,
    status: String,
    schema_id: Option<Uuid>,
    sdl: Option<String>,
    application_id: Option<Uuid>,
    selected_fields: Option<String>,
    grant_duration: Option<String>,
    retry_count: i32,
    max_retries: i32,
    next_retry_at: Option<DateTime<Utc>>,
    error: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            job_id: row.try_get("job_id")?,
            job_type: row.try_get("job_type")?,
            status: row.try_get("status")?,
            schema_id: row.try_get("schema_id")?,
            sdl: row.try_get("sdl")?,
            application_id: row.try_get("application_id")?,
            selected_fields: row.try_get("selected_fields")?,
            grant_duration: row.try_get("grant_duration")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            next_retry_at: row.try_get("next_retry_at")?,
            error: row.try_get("error")?,
            processed_at: row.try_get("processed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let job_type: JobType = row.job_type.parse().map_err(JobStoreError::Serialization)?;
        let status: JobStatus = row.status.parse().map_err(JobStoreError::Serialization)?;

        Ok(Job {
            id: JobId::from_uuid(row.job_id),
            job_type,
            status,
            schema_id: row.schema_id.map(SchemaId::from_uuid),
            sdl: row.sdl,
            application_id: row.application_id.map(ApplicationId::from_uuid),
            selected_fields: row.selected_fields,
            grant_duration: row.grant_duration,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            next_retry_at: row.next_retry_at,
            error: row.error,
            processed_at: row.processed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::db;
    use crate::jobs::retry::RetryPolicy;
    use crate::jobs::types::AttemptOutcome;

    /// Connects to `DATABASE_URL`; returns `None` (test skipped) when unset.
    async fn store() -> Option<PostgresJobStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.expect("connect to DATABASE_URL");
        db::apply_schema(&pool).await.expect("apply schema");
        Some(PostgresJobStore::new(pool))
    }

    #[tokio::test]
    async fn postgres_job_lifecycle() {
        let Some(store) = store().await else {
            return;
        };

        // Backdated so it sorts ahead of rows left by other runs.
        let created = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let schema_id = SchemaId::new();
        let job = Job::create_policy_metadata(schema_id, "type Query", 5, created);
        store.insert(&job).await.unwrap();

        assert!(matches!(
            store.insert(&job).await,
            Err(JobStoreError::AlreadyExists(id)) if id == job.id
        ));

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert_eq!(store.find_by_schema(schema_id).await.unwrap().len(), 1);

        let now = Utc::now();
        let claimed = store.claim_batch(now, 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job.id);
        assert_eq!(claimed[0].status, JobStatus::Processing);

        // Already processing: a second claim must not see it.
        let again = store.claim_batch(now, 100).await.unwrap();
        assert!(again.iter().all(|j| j.id != job.id));
        let recovered = store
            .recover_stuck(now + Duration::seconds(1), now)
            .await
            .unwrap();
        assert!(recovered >= 1);
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Pending);

        let update = loaded.outcome(
            &AttemptOutcome::Retryable("pdp down".into()),
            &RetryPolicy::default(),
            now,
        );
        store.update(job.id, &update).await.unwrap();

        let retried = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.error.as_deref(), Some("pdp down"));
        assert!(retried.next_retry_at.is_some());

        assert!(matches!(
            store.update(JobId::new(), &update).await,
            Err(JobStoreError::NotFound(_))
        ));

        let stats = store.stats().await.unwrap();
        assert!(stats.pending >= 1);
    }
}
