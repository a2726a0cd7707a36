// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use thiserror::Error;

/// Broker-wide error taxonomy. Every error that crosses a connection
/// boundary is mapped to a stable `kind` string so clients can branch on
/// it without parsing the human-readable detail.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("job {job_id} is not owned by worker {worker_id}")]
    NotOwner { job_id: String, worker_id: String },

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("connection limit reached")]
    Overload,

    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl BrokerError {
    /// Stable machine-readable kind, used in wire `error` frames.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Validation(_) => "validation_error",
            BrokerError::Auth(_) => "auth_error",
            BrokerError::NotFound(_) => "not_found",
            BrokerError::NotOwner { .. } => "not_owner",
            BrokerError::StateConflict(_) => "state_conflict",
            BrokerError::Storage(_) => "storage_error",
            BrokerError::Overload => "overload",
            BrokerError::Timeout(_) => "timeout",
        }
    }

    /// Auth errors close the connection; everything else leaves it open.
    pub fn closes_connection(&self) -> bool {
        matches!(self, BrokerError::Auth(_))
    }
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        BrokerError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(BrokerError::Validation("x".into()).kind(), "validation_error");
        assert_eq!(BrokerError::Overload.kind(), "overload");
        assert_eq!(
            BrokerError::NotOwner {
                job_id: "j1".into(),
                worker_id: "w1".into()
            }
            .kind(),
            "not_owner"
        );
    }

    #[test]
    fn only_auth_closes_connection() {
        assert!(BrokerError::Auth("bad token".into()).closes_connection());
        assert!(!BrokerError::Validation("x".into()).closes_connection());
        assert!(!BrokerError::Overload.closes_connection());
    }
}
