//! `portal-core`: domain primitives shared by the portal services.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, the domain error model and the clock abstraction used to keep
//! time-dependent logic deterministic under test.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{ApplicationId, JobId, MemberId, SchemaId};
