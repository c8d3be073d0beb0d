use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// The error taxonomy the core core raises, mapped to HTTP status codes at
/// the handler boundary. Caller-facing variants carry a human-readable
/// message naming the offending field or phase; server-facing variants carry
/// a short description and the offending numeric threshold where applicable.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("convergence failure: {0}")]
    ConvergenceFailure(String),

    #[error("computation error: {0}")]
    ComputationError(String),

    #[error("computation timeout: {0}")]
    ComputationTimeout(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl EngineError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn invalid_data(msg: impl Into<String>) -> Self {
        Self::InvalidData(msg.into())
    }

    pub fn insufficient_data(msg: impl Into<String>) -> Self {
        Self::InsufficientData(msg.into())
    }

    pub fn convergence_failure(msg: impl Into<String>) -> Self {
        Self::ConvergenceFailure(msg.into())
    }

    pub fn computation_error(msg: impl Into<String>) -> Self {
        Self::ComputationError(msg.into())
    }

    pub fn computation_timeout(msg: impl Into<String>) -> Self {
        Self::ComputationTimeout(msg.into())
    }

    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn validation_error(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::InvalidData(_) => "InvalidData",
            Self::InsufficientData(_) => "InsufficientData",
            Self::ConvergenceFailure(_) => "ConvergenceFailure",
            Self::ComputationError(_) => "ComputationError",
            Self::ComputationTimeout(_) => "ComputationTimeout",
            Self::StoreUnavailable(_) => "StoreUnavailable",
            Self::ValidationError(_) => "ValidationError",
            Self::NotFound(_) => "NotFound",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::InvalidData(_) | Self::InsufficientData(_) | Self::ValidationError(_) => {
                StatusCode::BAD_REQUEST
            },
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ConvergenceFailure(_)
            | Self::ComputationError(_)
            | Self::ComputationTimeout(_)
            | Self::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::store_unavailable(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for EngineError {
    fn from(err: arrow::error::ArrowError) -> Self {
        EngineError::computation_error(err.to_string())
    }
}

impl From<parquet::errors::ParquetError> for EngineError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        EngineError::store_unavailable(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::store_unavailable(err.to_string())
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::error!(kind = self.kind(), "{}", self);
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
