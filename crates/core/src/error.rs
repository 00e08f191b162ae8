//! Domain error model.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Rejections raised before anything is written.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("{entity} {field} must not be empty")]
    EmptyField {
        entity: &'static str,
        field: &'static str,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid {kind}: {reason}")]
    InvalidId { kind: &'static str, reason: String },
}

impl DomainError {
    pub fn empty_field(entity: &'static str, field: &'static str) -> Self {
        Self::EmptyField { entity, field }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
