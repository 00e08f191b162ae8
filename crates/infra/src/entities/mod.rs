//! Business entities whose creation must reach the PDP.

pub mod model;
pub mod postgres;
pub mod store;

pub use model::{Application, NewApplication, NewSchema, Schema};
pub use postgres::PostgresEntityStore;
pub use store::{EntityStore, EntityStoreError};
