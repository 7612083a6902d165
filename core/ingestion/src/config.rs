//! Environment-driven configuration for the service and CLI

use chat_grapher_indexing::{
    EmbeddingProvider, GraphStore, HashEmbedder, InMemoryGraphStore, InMemoryVectorStore,
    Neo4jGraphStore, OllamaEmbedder, QdrantVectorStore, VectorStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{IngestError, Result};
use crate::extensions::{ConceptExtractor, KeywordConceptExtractor, StructuralMetrics};
use crate::ledger::IngestLedger;
use crate::processor::{Collaborators, ProcessorConfig, WriteMode};
use crate::retry::RetryPolicy;
use crate::traversal::TraversalOrder;
use crate::tree::{ReconstructOptions, RootPolicy, ThreadIdentity};
use crate::units::UnitGranularity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process stores; nothing survives the process
    Memory,
    /// Qdrant for vectors, Neo4j for the graph
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderKind {
    Hash,
    Ollama,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConceptMode {
    None,
    Keywords,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub store_backend: StoreBackend,
    pub collection: String,
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub neo4j_url: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub neo4j_database: String,
    pub embedder: EmbedderKind,
    pub ollama_url: String,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub concurrency: usize,
    pub root_policy: RootPolicy,
    pub granularity: UnitGranularity,
    pub write_mode: WriteMode,
    pub concepts: ConceptMode,
    pub ledger_path: Option<PathBuf>,
    pub bind_addr: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Memory,
            collection: "chat_embeddings".to_string(),
            qdrant_url: "http://localhost:6333".to_string(),
            qdrant_api_key: None,
            neo4j_url: "http://localhost:7474".to_string(),
            neo4j_user: "neo4j".to_string(),
            neo4j_password: "neo4j".to_string(),
            neo4j_database: "neo4j".to_string(),
            embedder: EmbedderKind::Hash,
            ollama_url: "http://localhost:11434".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            embedding_dim: 384,
            max_retries: 3,
            retry_base_ms: 500,
            concurrency: 1,
            root_policy: RootPolicy::InferParentless,
            granularity: UnitGranularity::Message,
            write_mode: WriteMode::Create,
            concepts: ConceptMode::None,
            ledger_path: None,
            bind_addr: "127.0.0.1:21953".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str, default: String| lookup(key).unwrap_or(default);

        let store_backend = match lookup("STORE_BACKEND").as_deref() {
            None | Some("memory") => StoreBackend::Memory,
            Some("remote") => StoreBackend::Remote,
            Some(other) => return Err(invalid("STORE_BACKEND", other)),
        };

        let embedder = match lookup("EMBEDDING_PROVIDER").as_deref() {
            None | Some("hash") => EmbedderKind::Hash,
            Some("ollama") => EmbedderKind::Ollama,
            Some(other) => return Err(invalid("EMBEDDING_PROVIDER", other)),
        };

        let concepts = match lookup("CONCEPT_EXTRACTOR").as_deref() {
            None | Some("none") => ConceptMode::None,
            Some("keywords") => ConceptMode::Keywords,
            Some(other) => return Err(invalid("CONCEPT_EXTRACTOR", other)),
        };

        let root_policy = match lookup("ROOT_POLICY") {
            None => defaults.root_policy,
            Some(raw) => RootPolicy::parse(&raw).ok_or_else(|| invalid("ROOT_POLICY", &raw))?,
        };

        let granularity = match lookup("UNIT_GRANULARITY") {
            None => defaults.granularity,
            Some(raw) => {
                UnitGranularity::parse(&raw).ok_or_else(|| invalid("UNIT_GRANULARITY", &raw))?
            }
        };

        let write_mode = match lookup("WRITE_MODE") {
            None => defaults.write_mode,
            Some(raw) => WriteMode::parse(&raw).ok_or_else(|| invalid("WRITE_MODE", &raw))?,
        };

        Ok(Self {
            store_backend,
            collection: text("VECTOR_COLLECTION", defaults.collection),
            qdrant_url: text("QDRANT_URL", defaults.qdrant_url),
            qdrant_api_key: lookup("QDRANT_API_KEY").filter(|key| !key.is_empty()),
            neo4j_url: text("NEO4J_URL", defaults.neo4j_url),
            neo4j_user: text("NEO4J_USER", defaults.neo4j_user),
            neo4j_password: text("NEO4J_PASSWORD", defaults.neo4j_password),
            neo4j_database: text("NEO4J_DATABASE", defaults.neo4j_database),
            embedder,
            ollama_url: text("OLLAMA_URL", defaults.ollama_url),
            embedding_model: text("EMBEDDING_MODEL", defaults.embedding_model),
            embedding_dim: number(&lookup, "EMBEDDING_DIM", defaults.embedding_dim)?,
            max_retries: number(&lookup, "STORE_MAX_RETRIES", defaults.max_retries)?,
            retry_base_ms: number(&lookup, "STORE_RETRY_BASE_MS", defaults.retry_base_ms)?,
            concurrency: number(&lookup, "INGEST_CONCURRENCY", defaults.concurrency)?.max(1),
            root_policy,
            granularity,
            write_mode,
            concepts,
            ledger_path: lookup("LEDGER_PATH")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            bind_addr: text("BIND_ADDR", defaults.bind_addr),
        })
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        // Upsert only converges when reruns reproduce the same thread ids
        let identity = match self.write_mode {
            WriteMode::Upsert => ThreadIdentity::SourceStable,
            WriteMode::Create => ThreadIdentity::Fresh,
        };

        ProcessorConfig {
            collection: self.collection.clone(),
            reconstruct: ReconstructOptions {
                root_policy: self.root_policy,
                identity,
            },
            granularity: self.granularity,
            order: TraversalOrder::BreadthFirst,
            write_mode: self.write_mode,
            retry: RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_base_ms)),
            concurrency: self.concurrency,
            resume: false,
        }
    }

    pub fn build_embedder(&self) -> Arc<dyn EmbeddingProvider> {
        match self.embedder {
            EmbedderKind::Hash => Arc::new(HashEmbedder::new(self.embedding_dim)),
            EmbedderKind::Ollama => Arc::new(OllamaEmbedder::new(
                Some(self.ollama_url.clone()),
                Some(self.embedding_model.clone()),
                self.embedding_dim,
            )),
        }
    }

    /// Wire the stores, embedder and extensions this configuration names
    pub async fn build_collaborators(&self) -> Result<Collaborators> {
        let merge = self.write_mode == WriteMode::Upsert;

        let (vectors, graph): (Arc<dyn VectorStore>, Arc<dyn GraphStore>) =
            match self.store_backend {
            StoreBackend::Memory => {
                info!("Using in-memory vector and graph stores");
                (
                    Arc::new(InMemoryVectorStore::new()),
                    Arc::new(InMemoryGraphStore::new().with_merge(merge)),
                )
            }
            StoreBackend::Remote => {
                info!(
                    "Using Qdrant at {} and Neo4j at {}",
                    self.qdrant_url, self.neo4j_url
                );

                let qdrant = QdrantVectorStore::new(self.qdrant_url.clone(), self.qdrant_api_key.clone());
                qdrant
                    .ensure_collection(&self.collection, self.embedding_dim)
                    .await
                    .map_err(|e| {
                        IngestError::Config(format!(
                            "vector collection {} unavailable: {}",
                            self.collection, e
                        ))
                    })?;

                let neo4j = Neo4jGraphStore::new(
                    self.neo4j_url.clone(),
                    self.neo4j_database.clone(),
                    self.neo4j_user.clone(),
                    self.neo4j_password.clone(),
                )
                .with_merge(merge);

                (Arc::new(qdrant), Arc::new(neo4j))
            }
        };

        let concepts: Arc<dyn ConceptExtractor> = match self.concepts {
            ConceptMode::None => Arc::new(crate::extensions::NoopConceptExtractor),
            ConceptMode::Keywords => Arc::new(KeywordConceptExtractor::new(5, 2)?),
        };

        Ok(Collaborators::new(vectors, graph, self.build_embedder())
            .with_concepts(concepts)
            .with_metrics(Arc::new(StructuralMetrics)))
    }

    pub fn open_ledger(&self) -> Result<Option<IngestLedger>> {
        match &self.ledger_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                info!("Ledger at {}", path.display());
                Ok(Some(IngestLedger::open(path)?))
            }
            None => Ok(None),
        }
    }
}

fn invalid(key: &str, value: &str) -> IngestError {
    IngestError::Config(format!("{}={:?} is not a recognised value", key, value))
}

fn number<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| IngestError::Config(format!("{}={:?} is not a number", key, raw))),
    }
}
