pub mod embedding;
pub mod error;
pub mod graph;
pub mod neo4j;
pub mod qdrant;
pub mod search;
pub mod vector;

pub use embedding::{EmbeddingProvider, HashEmbedder, OllamaEmbedder};
pub use error::StoreError;
pub use graph::{
    properties_from, validate_identifier, GraphNode, GraphRelationship, GraphStore,
    InMemoryGraphStore, Properties,
};
pub use neo4j::Neo4jGraphStore;
pub use qdrant::QdrantVectorStore;
pub use search::{SearchHit, SemanticSearch};
pub use vector::{
    cosine_similarity, point_id, InMemoryVectorStore, Payload, PayloadFilter, ScoredPoint,
    VectorStore,
};
