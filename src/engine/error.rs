use serde::Serialize;

use crate::model::ConflictingReservation;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("gone: {0}")]
    Gone(String),
    #[error("conflict: {reason}")]
    Conflict {
        reason: String,
        conflicts: Vec<ConflictingReservation>,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable classification of a failure, for transports to map onto their
/// own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Gone,
    Conflict,
    Internal,
}

impl ErrorKind {
    /// HTTP-style status number.
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::InvalidArgument => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Gone => 410,
            ErrorKind::Internal => 500,
        }
    }

    /// Wire code, matching the serialized form.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Gone => "GONE",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Gone => "gone",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        }
    }
}

impl EngineError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        EngineError::InvalidArgument(reason.into())
    }

    pub fn conflict(reason: impl Into<String>, conflicts: Vec<ConflictingReservation>) -> Self {
        EngineError::Conflict { reason: reason.into(), conflicts }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Gone(_) => ErrorKind::Gone,
            EngineError::Conflict { .. } => ErrorKind::Conflict,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Human-readable reason without the kind prefix.
    pub fn reason(&self) -> &str {
        match self {
            EngineError::InvalidArgument(r)
            | EngineError::NotFound(r)
            | EngineError::Gone(r)
            | EngineError::Internal(r) => r,
            EngineError::Conflict { reason, .. } => reason,
        }
    }

    pub fn conflicts(&self) -> &[ConflictingReservation] {
        match self {
            EngineError::Conflict { conflicts, .. } => conflicts,
            _ => &[],
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Overlap(conflicts) => {
                EngineError::conflict("period already reserved", conflicts)
            }
            StoreError::NotFound(id) => EngineError::NotFound(format!("{id} not found")),
            StoreError::InvalidTransition { id, from, .. } => {
                EngineError::NotFound(format!("reservation {id} is not pending (status {from})"))
            }
            StoreError::AlreadyExists(id) => {
                EngineError::conflict(format!("{id} already exists"), Vec::new())
            }
            StoreError::Invalid(msg) => EngineError::InvalidArgument(msg),
            StoreError::LimitExceeded(msg) => {
                EngineError::InvalidArgument(format!("limit exceeded: {msg}"))
            }
            StoreError::Wal(msg) => EngineError::Internal(format!("storage failure: {msg}")),
        }
    }
}
