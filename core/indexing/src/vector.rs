use async_trait::async_trait;
use chat_grapher_schemas::VectorRecordId;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

pub type Payload = Map<String, Value>;

/// Vector index interface. Implementations must be safe to call concurrently
/// and must report failures as errors.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Write one point. With `key` set the store deduplicates on it (upsert);
    /// without it every call creates a new record.
    async fn create_point(
        &self,
        collection: &str,
        key: Option<&str>,
        payload: Payload,
        vector: Vec<f32>,
    ) -> Result<VectorRecordId>;

    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<ScoredPoint>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: VectorRecordId,
    pub score: f32,
    pub payload: Payload,
}

/// Conjunction of payload equality conditions. Keys may be dotted paths
/// into nested objects (`context.title`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadFilter {
    conditions: Vec<(String, Value)>,
}

impl PayloadFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn must(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((key.into(), value.into()));
        self
    }

    pub fn from_map(map: &Map<String, Value>) -> Self {
        Self {
            conditions: map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        self.conditions
            .iter()
            .all(|(key, expected)| lookup(payload, key) == Some(expected))
    }
}

fn lookup<'a>(payload: &'a Payload, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = payload.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Point id for a write: UUID v5 of the natural key when one is supplied,
/// so repeated writes land on the same record; a random UUID otherwise.
pub fn point_id(key: Option<&str>) -> String {
    match key {
        Some(key) => Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string(),
        None => Uuid::new_v4().to_string(),
    }
}

struct StoredPoint {
    id: String,
    vector: Vec<f32>,
    payload: Payload,
}

/// In-memory vector store for tests and dry runs
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: Mutex<HashMap<String, Vec<StoredPoint>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: &str) -> usize {
        let collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        collections.get(collection).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Payload of a stored point, if present
    pub fn payload(&self, collection: &str, id: &VectorRecordId) -> Option<Payload> {
        let collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        collections
            .get(collection)?
            .iter()
            .find(|p| p.id == id.0)
            .map(|p| p.payload.clone())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn create_point(
        &self,
        collection: &str,
        key: Option<&str>,
        payload: Payload,
        vector: Vec<f32>,
    ) -> Result<VectorRecordId> {
        let id = point_id(key);
        let mut collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        let points = collections.entry(collection.to_string()).or_default();

        match points.iter_mut().find(|p| p.id == id) {
            Some(existing) => {
                existing.vector = vector;
                existing.payload = payload;
                debug!("Upserted point {} in {}", id, collection);
            }
            None => {
                points.push(StoredPoint {
                    id: id.clone(),
                    vector,
                    payload,
                });
                debug!("Created point {} in {}", id, collection);
            }
        }

        Ok(VectorRecordId(id))
    }

    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        let Some(points) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut scores: Vec<ScoredPoint> = points
            .iter()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| ScoredPoint {
                id: VectorRecordId(p.id.clone()),
                score: cosine_similarity(&vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();

        scores.sort_by(|a, b| b.score.total_cmp(&a.score));
        scores.truncate(limit);

        Ok(scores)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}
