//! Error types for Memora.
//!
//! Uses thiserror for ergonomic error definitions that integrate
//! with axum's response system.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::services::PendingIndexWrite;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Resource errors
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Generation errors
    #[error("Could not parse generation output after {attempts} attempt(s): {message}")]
    GenerationParse { attempts: u32, message: String },

    /// The graph committed but the index write did not. The pending entries
    /// can be replayed with `Memora::retry_index_write`.
    #[error("Interaction {} committed to the graph but the index write failed: {}", .0.interaction_id, .0.reason)]
    PartialCommit(Box<PendingIndexWrite>),

    #[error("No semantic index configured")]
    IndexNotConfigured,

    // External service errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("LLM error: {0}")]
    Llm(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 404
            Self::NotFound(_) => StatusCode::NOT_FOUND,

            // 409
            Self::AlreadyExists(_) => StatusCode::CONFLICT,

            // 400
            Self::Validation(_) => StatusCode::BAD_REQUEST,

            // 501
            Self::IndexNotConfigured => StatusCode::NOT_IMPLEMENTED,

            // 502
            Self::Llm(_) | Self::GenerationParse { .. } => StatusCode::BAD_GATEWAY,

            // 500
            Self::PartialCommit(_)
            | Self::Database(_)
            | Self::VectorStore(_)
            | Self::Embedding(_)
            | Self::Internal(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::GenerationParse { .. } => "GENERATION_PARSE_FAILURE",
            Self::PartialCommit(_) => "PARTIAL_COMMIT",
            Self::IndexNotConfigured => "INDEX_NOT_CONFIGURED",
            Self::Database(_) => "DATABASE_ERROR",
            Self::VectorStore(_) => "VECTOR_STORE_ERROR",
            Self::Embedding(_) => "EMBEDDING_ERROR",
            Self::Llm(_) => "LLM_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "UNKNOWN_ERROR",
        }
    }

    /// Whether the facade may redo extraction and reconciliation from scratch.
    pub fn is_generation_retryable(&self) -> bool {
        matches!(self, Self::GenerationParse { .. } | Self::Llm(_))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        let mut error = json!({
            "code": code,
            "message": message,
        });

        if let Self::PartialCommit(pending) = &self {
            error["interaction_id"] = json!(pending.interaction_id);
            error["memory_ids"] = json!(pending.memory_ids());
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

// Convenience conversions
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

impl From<memora_qdrant::Error> for Error {
    fn from(err: memora_qdrant::Error) -> Self {
        Self::VectorStore(err.to_string())
    }
}

impl From<memora_embeddings::Error> for Error {
    fn from(err: memora_embeddings::Error) -> Self {
        Self::Embedding(err.to_string())
    }
}

impl From<memora_llm::Error> for Error {
    fn from(err: memora_llm::Error) -> Self {
        Self::Llm(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::GenerationParse {
                attempts: 2,
                message: "bad".into()
            }
            .error_code(),
            "GENERATION_PARSE_FAILURE"
        );
    }

    #[test]
    fn test_generation_retryable() {
        assert!(Error::Llm("timeout".into()).is_generation_retryable());
        assert!(!Error::NotFound("x".into()).is_generation_retryable());
        assert!(!Error::VectorStore("x".into()).is_generation_retryable());
    }

    #[test]
    fn test_parse_failure_message_carries_attempts() {
        let err = Error::GenerationParse {
            attempts: 3,
            message: "missing field".into(),
        };
        assert!(err.to_string().contains("after 3 attempt(s)"));
    }
}
