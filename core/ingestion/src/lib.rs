pub mod config;
pub mod error;
pub mod extensions;
pub mod importer;
pub mod ledger;
pub mod processor;
pub mod retry;
pub mod session;
pub mod traversal;
pub mod tree;
pub mod units;

pub use config::{ConceptMode, EmbedderKind, PipelineConfig, StoreBackend};
pub use error::{IngestError, Result};
pub use extensions::{
    ConceptExtractor, KeywordConceptExtractor, MetricsExtractor, NoopConceptExtractor,
    NoopMetrics, StructuralMetrics, ThreadMetrics,
};
pub use importer::{
    ChatImporter, ConversationStream, ConversationsJsonImporter, ExportFormat,
    OpenAiExportImporter, PlaceholderImporter,
};
pub use ledger::IngestLedger;
pub use processor::{Collaborators, ConversationProcessor, ProcessorConfig, WriteMode};
pub use retry::RetryPolicy;
pub use session::ImportSlot;
pub use traversal::{breadth_first, BreadthFirst, TraversalOrder};
pub use tree::{reconstruct, ReconstructOptions, RootPolicy, ThreadIdentity};
pub use units::{UnitExtractor, UnitGranularity};
