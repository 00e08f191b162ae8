//! Postgres-backed entity store.
//!
//! The `*_with_job` inserts open one transaction, write the entity row, write
//! the job row through [`insert_job`], and commit. A failure at any step drops
//! the transaction, which rolls both rows back.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use async_trait::async_trait;
use portal_core::{ApplicationId, MemberId, SchemaId};

use super::model::{Application, Schema};
use super::store::{EntityStore, EntityStoreError};
use crate::external::pdp::SelectedFieldRecord;
use crate::jobs::postgres::{insert_job, is_unique_violation};
use crate::jobs::Job;

#[derive(Debug, Clone)]
pub struct PostgresEntityStore {
    pool: PgPool,
}

impl PostgresEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, EntityStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

async fn write_schema(tx: &mut Transaction<'_, Postgres>, schema: &Schema) -> Result<(), EntityStoreError> {
    sqlx::query(
        r#"
        INSERT INTO schemas (
            schema_id, member_id, name, description, sdl, endpoint, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(schema.id.as_uuid())
    .bind(schema.member_id.as_uuid())
    .bind(&schema.name)
    .bind(schema.description.as_deref())
    .bind(&schema.sdl)
    .bind(&schema.endpoint)
    .bind(schema.created_at)
    .bind(schema.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            EntityStoreError::Conflict {
                entity: "schema",
                id: schema.id.to_string(),
            }
        } else {
            map_sqlx_error("insert_schema", e)
        }
    })?;
    Ok(())
}

async fn write_application(
    tx: &mut Transaction<'_, Postgres>,
    application: &Application,
) -> Result<(), EntityStoreError> {
    sqlx::query(
        r#"
        INSERT INTO applications (
            application_id, member_id, name, description, selected_fields,
            grant_duration, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(application.id.as_uuid())
    .bind(application.member_id.as_uuid())
    .bind(&application.name)
    .bind(application.description.as_deref())
    .bind(Json(&application.selected_fields))
    .bind(application.grant_duration.as_str())
    .bind(application.created_at)
    .bind(application.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            EntityStoreError::Conflict {
                entity: "application",
                id: application.id.to_string(),
            }
        } else {
            map_sqlx_error("insert_application", e)
        }
    })?;
    Ok(())
}

#[async_trait]
impl EntityStore for PostgresEntityStore {
    #[instrument(skip(self, schema), fields(schema_id = %schema.id), err)]
    async fn insert_schema(&self, schema: &Schema) -> Result<(), EntityStoreError> {
        let mut tx = self.begin().await?;
        write_schema(&mut tx, schema).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self, schema, job), fields(schema_id = %schema.id, job_id = %job.id), err)]
    async fn insert_schema_with_job(&self, schema: &Schema, job: &Job) -> Result<(), EntityStoreError> {
        let mut tx = self.begin().await?;
        write_schema(&mut tx, schema).await?;
        insert_job(&mut tx, job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), fields(schema_id = %id), err)]
    async fn get_schema(&self, id: SchemaId) -> Result<Option<Schema>, EntityStoreError> {
        let row = sqlx::query(
            r#"
            SELECT schema_id, member_id, name, description, sdl, endpoint, created_at, updated_at
            FROM schemas
            WHERE schema_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_schema", e))?;

        row.map(|r| {
            SchemaRow::from_row(&r)
                .map(Schema::from)
                .map_err(|e| EntityStoreError::Storage(format!("failed to decode schema row: {e}")))
        })
        .transpose()
    }

    #[instrument(skip(self), fields(schema_id = %id), err)]
    async fn delete_schema(&self, id: SchemaId) -> Result<(), EntityStoreError> {
        let result = sqlx::query("DELETE FROM schemas WHERE schema_id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_schema", e))?;

        if result.rows_affected() == 0 {
            return Err(EntityStoreError::schema_not_found(id));
        }
        Ok(())
    }

    #[instrument(skip(self, application), fields(application_id = %application.id), err)]
    async fn insert_application(&self, application: &Application) -> Result<(), EntityStoreError> {
        let mut tx = self.begin().await?;
        write_application(&mut tx, application).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(
        skip(self, application, job),
        fields(application_id = %application.id, job_id = %job.id),
        err
    )]
    async fn insert_application_with_job(
        &self,
        application: &Application,
        job: &Job,
    ) -> Result<(), EntityStoreError> {
        let mut tx = self.begin().await?;
        write_application(&mut tx, application).await?;
        insert_job(&mut tx, job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), fields(application_id = %id), err)]
    async fn get_application(&self, id: ApplicationId) -> Result<Option<Application>, EntityStoreError> {
        let row = sqlx::query(
            r#"
            SELECT application_id, member_id, name, description, selected_fields,
                   grant_duration, created_at, updated_at
            FROM applications
            WHERE application_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_application", e))?;

        row.map(|r| {
            ApplicationRow::from_row(&r)
                .map_err(|e| EntityStoreError::Storage(format!("failed to decode application row: {e}")))
                .and_then(Application::try_from)
        })
        .transpose()
    }

    #[instrument(skip(self), fields(application_id = %id), err)]
    async fn delete_application(&self, id: ApplicationId) -> Result<(), EntityStoreError> {
        let result = sqlx::query("DELETE FROM applications WHERE application_id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_application", e))?;

        if result.rows_affected() == 0 {
            return Err(EntityStoreError::application_not_found(id));
        }
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EntityStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            EntityStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            EntityStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => EntityStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct SchemaRow {
    schema_id: Uuid,
    member_id: Uuid,
    name: String,
    description: Option<String>,
    sdl: String,
    endpoint: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SchemaRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(SchemaRow {
            schema_id: row.try_get("schema_id")?,
            member_id: row.try_get("member_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            sdl: row.try_get("sdl")?,
            endpoint: row.try_get("endpoint")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<SchemaRow> for Schema {
    fn from(row: SchemaRow) -> Self {
        Schema {
            id: SchemaId::from_uuid(row.schema_id),
            member_id: MemberId::from_uuid(row.member_id),
            name: row.name,
            description: row.description,
            sdl: row.sdl,
            endpoint: row.endpoint,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug)]
struct ApplicationRow {
    application_id: Uuid,
    member_id: Uuid,
    name: String,
    description: Option<String>,
    selected_fields: Json<Vec<SelectedFieldRecord>>,
    grant_duration: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ApplicationRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ApplicationRow {
            application_id: row.try_get("application_id")?,
            member_id: row.try_get("member_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            selected_fields: row.try_get("selected_fields")?,
            grant_duration: row.try_get("grant_duration")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ApplicationRow> for Application {
    type Error = EntityStoreError;

    fn try_from(row: ApplicationRow) -> Result<Self, Self::Error> {
        Ok(Application {
            id: ApplicationId::from_uuid(row.application_id),
            member_id: MemberId::from_uuid(row.member_id),
            name: row.name,
            description: row.description,
            selected_fields: row.selected_fields.0,
            grant_duration: row.grant_duration.parse().map_err(EntityStoreError::Storage)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
