use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::vector::{PayloadFilter, ScoredPoint, VectorStore};

/// Similarity search over the semantic units written by ingestion
pub struct SemanticSearch {
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    collection: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub record_id: String,
    pub score: f32,
    pub message_id: Option<String>,
    pub conversation_id: Option<String>,
    pub role: Option<String>,
    pub payload: Value,
}

impl From<ScoredPoint> for SearchHit {
    fn from(point: ScoredPoint) -> Self {
        let field = |key: &str| {
            point
                .payload
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        Self {
            record_id: point.id.0.clone(),
            score: point.score,
            message_id: field("message_id"),
            conversation_id: field("conversation_id"),
            role: field("role"),
            payload: Value::Object(point.payload.clone()),
        }
    }
}

impl SemanticSearch {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            vectors,
            embedder,
            collection: collection.into(),
        }
    }

    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<SearchHit>> {
        debug!("Searching for: {} (limit: {})", query, limit);

        let vector = self.embedder.embed(query).await?;
        let points = self
            .vectors
            .search(&self.collection, vector, limit, filter)
            .await?;

        debug!("Found {} results", points.len());
        Ok(points.into_iter().map(SearchHit::from).collect())
    }
}
