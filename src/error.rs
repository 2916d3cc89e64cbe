//! Error taxonomy shared by every engine component.

use thiserror::Error;

/// Errors surfaced by the orchestration engine.
///
/// Faults inside a running job or a tail session are recorded against that
/// job/subscription and never travel back through the scheduler.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid recurrence expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("execution fault: {0}")]
    ExecutionFault(String),

    #[error("log unavailable: {0}")]
    IoFault(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("malformed stored json: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
