//! Infrastructure layer: Postgres stores, the PDP outbox and its dispatcher,
//! entity services, external clients and configuration.

pub mod config;
pub mod db;
pub mod entities;
pub mod external;
pub mod in_memory;
pub mod jobs;
pub mod services;

#[cfg(test)]
mod testing;


pub use config::{ConfigError, WorkerConfig};
pub use in_memory::{FailPoint, InMemoryPortalStore};
pub use services::{ApplicationService, ConsistencyStrategy, ProducerConfig, SchemaService, ServiceError};
