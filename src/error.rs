//! Crate-wide error kind, unifying the module-level `thiserror` enums into
//! the seven stable error kinds the core promises callers (see spec §7).

use thiserror::Error;

/// Stable error kind. Names are part of the contract; do not rename variants
/// without updating the HTTP status-code mapping the embedding frontend uses.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        CoreError::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        CoreError::Unauthorized(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }

    /// HTTP status code a frontend should map this kind to (spec §6).
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::InvalidInput(_) => 400,
            CoreError::Unauthorized(_) => 405,
            CoreError::NotFound(_) => 404,
            CoreError::Conflict(_) => 409,
            CoreError::NetworkUnavailable(_) => 503,
            CoreError::Cancelled => 499,
            CoreError::Internal(_) => 500,
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => CoreError::NotFound(e.to_string()),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Internal(e.to_string())
    }
}
