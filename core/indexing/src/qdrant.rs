//! Qdrant vector store client over the REST API.

use async_trait::async_trait;
use chat_grapher_schemas::VectorRecordId;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::vector::{point_id, Payload, PayloadFilter, ScoredPoint, VectorStore};

pub struct QdrantVectorStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl QdrantVectorStore {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("api-key", key),
            None => request,
        }
    }

    /// Create the collection with cosine distance unless it already exists
    pub async fn ensure_collection(&self, collection: &str, dimension: usize) -> Result<()> {
        let url = format!("{}/collections/{}", self.base_url, collection);

        let response = self.authorize(self.client.get(&url)).send().await?;
        if response.status().is_success() {
            debug!("Collection {} already exists", collection);
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(StoreError::from_response(response).await);
        }

        let body = json!({
            "vectors": {
                "size": dimension,
                "distance": "Cosine"
            }
        });

        let response = self.authorize(self.client.put(&url)).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::from_response(response).await);
        }

        info!("Created collection {} ({} dimensions)", collection, dimension);
        Ok(())
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn create_point(
        &self,
        collection: &str,
        key: Option<&str>,
        payload: Payload,
        vector: Vec<f32>,
    ) -> Result<VectorRecordId> {
        let id = point_id(key);
        let url = format!("{}/collections/{}/points?wait=true", self.base_url, collection);

        let body = json!({
            "points": [{
                "id": id,
                "vector": vector,
                "payload": payload
            }]
        });

        let response = self.authorize(self.client.put(&url)).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::from_response(response).await);
        }

        let reply: QdrantReply<Value> = response.json().await?;
        if reply.status.as_ref().and_then(Value::as_str) != Some("ok") {
            return Err(StoreError::Rejected(format!(
                "upsert into {} returned status {:?}",
                collection, reply.status
            )));
        }

        debug!("Wrote point {} to {}", id, collection);
        Ok(VectorRecordId(id))
    }

    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<ScoredPoint>> {
        let url = format!("{}/collections/{}/points/search", self.base_url, collection);

        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true
        });

        if !filter.is_empty() {
            let must: Vec<Value> = filter
                .conditions()
                .iter()
                .map(|(key, value)| json!({"key": key, "match": {"value": value}}))
                .collect();
            body["filter"] = json!({ "must": must });
        }

        let response = self.authorize(self.client.post(&url)).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::from_response(response).await);
        }

        let reply: QdrantReply<Vec<QdrantHit>> = response.json().await?;
        let hits = reply
            .result
            .ok_or_else(|| StoreError::InvalidResponse("search reply without result".to_string()))?;

        Ok(hits
            .into_iter()
            .map(|hit| ScoredPoint {
                id: VectorRecordId(match hit.id {
                    Value::String(s) => s,
                    other => other.to_string(),
                }),
                score: hit.score,
                payload: hit.payload.unwrap_or_default(),
            })
            .collect())
    }
}

// Response structures
#[derive(Debug, Deserialize)]
struct QdrantReply<T> {
    status: Option<Value>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct QdrantHit {
    id: Value,
    score: f32,
    payload: Option<Payload>,
}
