//! Error kinds shared across the ingest, storage, index and query layers.
//!
//! Mirrors the taxonomy a log-aggregation service needs at its HTTP
//! boundary: input/query parsing failures surface to the caller, storage
//! failures are logged and recovered from wherever possible.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("live-tail queue full, entry dropped")]
    BackpressureDrop,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl AppError {
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BackpressureDrop => StatusCode::OK,
            AppError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
