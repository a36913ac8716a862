//! Orchestrator-level error model.

use thiserror::Error;

use dialtone_compliance::AttemptType;
use dialtone_core::DomainError;

use crate::attempt_log::AttemptLogError;
use crate::store::StoreError;

pub type ComplianceResult<T> = Result<T, ComplianceError>;

#[derive(Debug, Error)]
pub enum ComplianceError {
    /// Local checks failed. Nothing was dispatched and no attempt was written.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The attempt was recorded as a retriable error; status is unchanged.
    #[error("{step} failed with a retriable error: {reason}")]
    RetriableGateway { step: AttemptType, reason: String },

    /// Upstream rejected the submission; the sub-entity is rejected.
    #[error("{step} was rejected upstream: {reason}")]
    FatalGateway { step: AttemptType, reason: String },

    /// A concurrent write won, or the resource is held by someone else.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A pending attempt has to be resolved before anything else is dispatched.
    #[error("attempt {attempt_id} is still pending and must be reconciled first")]
    ReconciliationRequired { attempt_id: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("attempt log error: {0}")]
    AttemptLog(String),

    /// A request snapshot could not be encoded for the audit trail.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ComplianceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn retriable(step: AttemptType, reason: impl Into<String>) -> Self {
        Self::RetriableGateway {
            step,
            reason: reason.into(),
        }
    }

    pub fn fatal(step: AttemptType, reason: impl Into<String>) -> Self {
        Self::FatalGateway {
            step,
            reason: reason.into(),
        }
    }
}

impl From<DomainError> for ComplianceError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
            DomainError::InvariantViolation(msg) => Self::InvariantViolation(msg),
            DomainError::NotFound => Self::NotFound("resource".to_string()),
            DomainError::Conflict(msg) => Self::Conflict(msg),
        }
    }
}

impl From<StoreError> for ComplianceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => Self::Conflict(msg),
            StoreError::TenantIsolation(msg) => Self::TenantIsolation(msg),
            other => Self::Store(other),
        }
    }
}

impl From<AttemptLogError> for ComplianceError {
    fn from(err: AttemptLogError) -> Self {
        match err {
            AttemptLogError::InFlight(existing) => Self::ReconciliationRequired {
                attempt_id: existing.id.to_string(),
            },
            AttemptLogError::AlreadyFinalized(id) => {
                Self::Conflict(format!("attempt {id} already finalized"))
            }
            AttemptLogError::NotFound(id) => Self::NotFound(format!("attempt {id}")),
            AttemptLogError::Store(err) => err.into(),
            AttemptLogError::Corrupt(msg) => Self::AttemptLog(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn unencodable_snapshot_is_an_error() {
        // JSON object keys must be strings.
        let snapshot: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
        let err: ComplianceError = serde_json::to_value(&snapshot).unwrap_err().into();
        assert!(matches!(err, ComplianceError::Serialization(_)));
    }
}
