//! Transactional outbox for PDP side effects.
//!
//! ## Design
//!
//! - Entity services write a `pending` [`Job`] in the same transaction as the
//!   entity it describes
//! - A [`JobDispatcher`] polls the store, claims ready jobs with a skip-locked
//!   read, calls the PDP and records the outcome
//! - Failures are retried with exponential backoff up to `max_retries`; jobs
//!   stuck in `processing` are swept back to `pending`
//!
//! ## Components
//!
//! - `Job` / `JobUpdate`: the outbox row and its state machine
//! - `JobStore`: persistence (Postgres, or in-memory for tests)
//! - `handlers`: per-`JobType` execution against the PDP
//! - `JobDispatcher`: the polling consumer

pub mod dispatcher;
pub mod handlers;
pub mod postgres;
pub mod retry;
pub mod store;
pub mod types;

pub use dispatcher::{DispatcherConfig, DispatcherHandle, DispatcherStats, JobDispatcher, TickReport};
pub use handlers::{JobError, PdpCommand};
pub use postgres::PostgresJobStore;
pub use retry::{DEFAULT_MAX_RETRIES, RetryPolicy};
pub use store::{JobFilter, JobStats, JobStore, JobStoreError};
pub use types::{AttemptOutcome, Job, JobStatus, JobType, JobUpdate};
