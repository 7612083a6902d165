//! Error types shared by the store and embedding clients.

use thiserror::Error;

/// Result type alias for collaborator calls.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors reported by the vector store, graph store and embedding clients.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport failure (unreachable host, timeout, TLS).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote service answered with a non-success status.
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    /// Remote service accepted the request but reported an error.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Response body did not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Label, relationship type or property key is not a plain identifier.
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        StoreError::Status { status, body }
    }

    /// Whether repeating the same call may succeed. Shape and identifier
    /// errors never will.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Http(_) => true,
            StoreError::Status { status, .. } => *status == 429 || *status >= 500,
            StoreError::Rejected(message) => message.contains("TransientError"),
            _ => false,
        }
    }
}
