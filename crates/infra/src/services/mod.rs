//! Entity services: the producers of outbox jobs.
//!
//! Each service is built for one [`ConsistencyStrategy`] and keeps it for its
//! lifetime, so an entity type never mixes the two.

pub mod application;
pub mod saga;
pub mod schema;

use portal_core::DomainError;

use crate::entities::EntityStoreError;
use crate::external::pdp::PdpError;
use crate::jobs::{DEFAULT_MAX_RETRIES, JobStoreError};

pub use application::ApplicationService;
pub use schema::SchemaService;

/// Settings the entity services stamp onto every job they create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Failed attempts tolerated before a job is marked `failed`.
    pub max_retries: u32,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// How entity creation reaches the PDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyStrategy {
    /// Entity and job commit together; the dispatcher calls the PDP later.
    #[default]
    Outbox,
    /// The PDP is called before returning; the entity is deleted if it fails.
    Saga,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] EntityStoreError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error("failed to encode job payload: {0}")]
    Payload(String),
    /// Saga only: the PDP call failed and the entity was removed.
    #[error("PDP call failed: {0}")]
    Pdp(PdpError),
    /// Saga only: the PDP call failed and the entity could not be removed.
    #[error("PDP call failed: {pdp}; compensation failed: {compensation}")]
    CompensationFailed {
        pdp: PdpError,
        compensation: EntityStoreError,
    },
}
