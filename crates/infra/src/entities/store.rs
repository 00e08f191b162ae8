//! Entity persistence.

use async_trait::async_trait;

use portal_core::{ApplicationId, SchemaId};

use super::model::{Application, Schema};
use crate::jobs::{Job, JobStoreError};

/// Storage for schemas and applications.
///
/// The `*_with_job` methods are the outbox write path: the entity row and
/// its job row commit in one unit of work, or neither is persisted.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn insert_schema(&self, schema: &Schema) -> Result<(), EntityStoreError>;

    async fn insert_schema_with_job(&self, schema: &Schema, job: &Job) -> Result<(), EntityStoreError>;

    async fn get_schema(&self, id: SchemaId) -> Result<Option<Schema>, EntityStoreError>;

    /// Fails with [`EntityStoreError::NotFound`] when no row was deleted.
    async fn delete_schema(&self, id: SchemaId) -> Result<(), EntityStoreError>;

    async fn insert_application(&self, application: &Application) -> Result<(), EntityStoreError>;

    async fn insert_application_with_job(
        &self,
        application: &Application,
        job: &Job,
    ) -> Result<(), EntityStoreError>;

    async fn get_application(&self, id: ApplicationId) -> Result<Option<Application>, EntityStoreError>;

    async fn delete_application(&self, id: ApplicationId) -> Result<(), EntityStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EntityStoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} already exists: {id}")]
    Conflict { entity: &'static str, id: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("job write failed: {0}")]
    Job(#[from] JobStoreError),
}

impl EntityStoreError {
    pub fn schema_not_found(id: SchemaId) -> Self {
        Self::NotFound {
            entity: "schema",
            id: id.to_string(),
        }
    }

    pub fn application_not_found(id: ApplicationId) -> Self {
        Self::NotFound {
            entity: "application",
            id: id.to_string(),
        }
    }
}
