//! Error taxonomy for the ingestion pipeline

use chat_grapher_indexing::StoreError;
use chat_grapher_schemas::{ConversationFailure, FailureKind, RunStats, Stage};
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Importer validation failed; nothing was processed
    #[error("invalid source for {importer} importer: {}", .location.display())]
    InvalidSource {
        importer: &'static str,
        location: PathBuf,
    },

    /// One conversation record lacks a usable mapping or root
    #[error("malformed conversation {conversation}: {reason}")]
    MalformedSourceData {
        conversation: String,
        reason: String,
    },

    /// Vector or graph store write failed after retries
    #[error("store write failed during {stage} for conversation {conversation_id}: {source}")]
    StoreWriteFailure {
        conversation_id: String,
        stage: Stage,
        #[source]
        source: StoreError,
    },

    /// Embedding provider failed after retries
    #[error("embedding failed for message {message_id} in conversation {conversation_id}: {source}")]
    EmbeddingFailure {
        conversation_id: String,
        message_id: String,
        #[source]
        source: StoreError,
    },

    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),

    /// A fatal error stopped the run; carries the statistics gathered so far
    #[error("run {} aborted: {source}", .stats.run_id)]
    RunAborted {
        #[source]
        source: Box<IngestError>,
        stats: Box<RunStats>,
    },
}

impl IngestError {
    pub fn malformed(conversation: impl Into<String>, reason: impl Into<String>) -> Self {
        IngestError::MalformedSourceData {
            conversation: conversation.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error must abort the whole run rather than skip one
    /// conversation
    pub fn is_fatal(&self) -> bool {
        !matches!(self, IngestError::MalformedSourceData { .. })
    }

    /// Stage the error belongs to, for run statistics and resume
    pub fn stage(&self) -> Stage {
        match self {
            IngestError::EmbeddingFailure { .. } => Stage::EmbeddingWrite,
            IngestError::StoreWriteFailure { stage, .. } => *stage,
            IngestError::RunAborted { source, .. } => source.stage(),
            _ => Stage::Reconstructing,
        }
    }

    /// Conversation the error is attributed to, when known
    pub fn conversation(&self) -> Option<&str> {
        match self {
            IngestError::MalformedSourceData { conversation, .. } => Some(conversation),
            IngestError::StoreWriteFailure {
                conversation_id, ..
            }
            | IngestError::EmbeddingFailure {
                conversation_id, ..
            } => Some(conversation_id),
            IngestError::RunAborted { source, .. } => source.conversation(),
            _ => None,
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            IngestError::MalformedSourceData { .. } => FailureKind::MalformedSourceData,
            IngestError::EmbeddingFailure { .. } => FailureKind::EmbeddingFailure,
            _ => FailureKind::StoreWriteFailure,
        }
    }

    pub fn to_failure(&self, fallback_conversation: &str) -> ConversationFailure {
        ConversationFailure {
            conversation_id: self
                .conversation()
                .unwrap_or(fallback_conversation)
                .to_string(),
            stage: self.stage(),
            kind: self.failure_kind(),
            message: self.to_string(),
        }
    }
}
