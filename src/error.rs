use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the analytics engine.
///
/// Sample insufficiency and missing baselines are not errors: they come back
/// as data (`Ranking::InsufficientSamples`, `RunStatus::InsufficientData`,
/// `Flag::NoRef`).
#[derive(Debug, Error)]
pub enum GateError {
    #[error("invalid period range: {0}")]
    InvalidRange(String),

    #[error("invalid period key '{0}'")]
    InvalidPeriod(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream unavailable during {operation}: {reason}")]
    UpstreamUnavailable {
        operation: &'static str,
        reason: String,
    },

    #[error("storage error during {operation}: {reason}")]
    Storage {
        operation: &'static str,
        reason: String,
    },
}

impl GateError {
    /// Whether the caller may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GateError::UpstreamUnavailable { .. })
    }

    pub(crate) fn from_store(operation: &'static str, err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => GateError::UpstreamUnavailable { operation, reason },
            StoreError::Conflict(reason) => GateError::StateConflict(reason),
            StoreError::NotFound(what) => GateError::NotFound(what),
            StoreError::Decode(reason) | StoreError::Backend(reason) => {
                GateError::Storage { operation, reason }
            }
        }
    }
}

pub type Result<T, E = GateError> = std::result::Result<T, E>;
