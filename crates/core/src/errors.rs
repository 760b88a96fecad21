use thiserror::Error;

use crate::domain::run::RunRequestStatus;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid run request transition from {from:?} to {to:?}")]
    InvalidStatusTransition { from: RunRequestStatus, to: RunRequestStatus },
    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}
