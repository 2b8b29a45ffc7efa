use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt::Display;

/// Whether a failed call to a model service is worth repeating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeouts, rate limits, upstream 5xx and dropped connections
    Transient,
    /// Authentication failures, malformed requests, unknown models
    Fatal,
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Application-level errors
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Embedding service error ({kind}): {message}")]
    EmbeddingService { kind: FailureKind, message: String },

    #[error("Embedding payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Generation service error ({kind}): {message}")]
    GenerationService { kind: FailureKind, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn embedding(kind: FailureKind, message: impl Into<String>) -> Self {
        AppError::EmbeddingService {
            kind,
            message: message.into(),
        }
    }

    pub fn generation(kind: FailureKind, message: impl Into<String>) -> Self {
        AppError::GenerationService {
            kind,
            message: message.into(),
        }
    }

    /// True for model-service failures that may succeed if repeated
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::EmbeddingService {
                kind: FailureKind::Transient,
                ..
            } | AppError::GenerationService {
                kind: FailureKind::Transient,
                ..
            }
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::IndexUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::EmbeddingService { kind, .. } | AppError::GenerationService { kind, .. } => {
                match kind {
                    FailureKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
                    FailureKind::Fatal => StatusCode::BAD_GATEWAY,
                }
            }
            AppError::PayloadTooLarge(_) | AppError::Parse(_) => StatusCode::BAD_GATEWAY,
            AppError::Catalog(_)
            | AppError::Io(_)
            | AppError::Serialization(_)
            | AppError::Csv(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match &self {
            AppError::InvalidInput(msg) | AppError::IndexUnavailable(msg) => msg.clone(),
            _ => self.to_string(),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
