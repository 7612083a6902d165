//! Ingestion pipeline: importer -> tree -> semantic units -> vector store
//! -> graph store, one conversation at a time (or a bounded number at once).
//!
//! Writes to the two stores share no transaction. Upsert mode plus the
//! ledger make a rerun converge instead of duplicating.

use chat_grapher_indexing::{
    EmbeddingProvider, GraphStore, Payload, Properties, StoreError, VectorStore,
};
use chat_grapher_schemas::{
    generate_run_id, ConversationId, ConversationReport, ConversationThread, RawConversation,
    RunId, RunPhase, RunStats, Stage, UnitType, VectorRecordId,
};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{IngestError, Result};
use crate::extensions::{
    ConceptExtractor, MetricsExtractor, NoopConceptExtractor, NoopMetrics, ThreadMetrics,
};
use crate::importer::ChatImporter;
use crate::ledger::IngestLedger;
use crate::retry::RetryPolicy;
use crate::traversal::TraversalOrder;
use crate::tree::{self, ReconstructOptions};
use crate::units::{UnitExtractor, UnitGranularity};

pub const CONVERSATION_LABEL: &str = "Conversation";
pub const MESSAGE_LABEL: &str = "Message";
pub const CONCEPT_LABEL: &str = "Concept";
pub const BELONGS_TO: &str = "BELONGS_TO";
pub const REPLIES_TO: &str = "REPLIES_TO";
pub const MENTIONS: &str = "MENTIONS";

/// Whether writes create new records or converge on natural keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Every run creates fresh vector points and graph nodes
    #[default]
    Create,
    /// Vector points keyed by unit natural key, graph nodes merged by id
    Upsert,
}

impl WriteMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(WriteMode::Create),
            "upsert" => Some(WriteMode::Upsert),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Create => "create",
            WriteMode::Upsert => "upsert",
        }
    }
}

/// Long-lived client handles shared by every conversation in a run
#[derive(Clone)]
pub struct Collaborators {
    pub vectors: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub concepts: Arc<dyn ConceptExtractor>,
    pub metrics: Arc<dyn MetricsExtractor>,
}

impl Collaborators {
    /// Stores and embedder with no-op concept and metrics extensions
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            vectors,
            graph,
            embedder,
            concepts: Arc::new(NoopConceptExtractor),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_concepts(mut self, concepts: Arc<dyn ConceptExtractor>) -> Self {
        self.concepts = concepts;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsExtractor>) -> Self {
        self.metrics = metrics;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub collection: String,
    pub reconstruct: ReconstructOptions,
    pub granularity: UnitGranularity,
    pub order: TraversalOrder,
    pub write_mode: WriteMode,
    pub retry: RetryPolicy,
    /// Conversations in flight at once; 1 keeps source order
    pub concurrency: usize,
    /// Skip conversations the ledger already has as committed
    pub resume: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            collection: "chat_embeddings".to_string(),
            reconstruct: ReconstructOptions::default(),
            granularity: UnitGranularity::default(),
            order: TraversalOrder::default(),
            write_mode: WriteMode::default(),
            retry: RetryPolicy::default(),
            concurrency: 1,
            resume: false,
        }
    }
}

/// Where per-stage progress is recorded for one conversation
struct Checkpoint<'a> {
    ledger: &'a Mutex<IngestLedger>,
    source: &'a str,
    key: &'a str,
    run_id: &'a RunId,
}

impl Checkpoint<'_> {
    async fn mark(&self, conversation_id: &ConversationId, stage: Stage) -> Result<()> {
        self.ledger
            .lock()
            .await
            .record_stage(self.source, self.key, conversation_id, self.run_id, stage)
    }
}

enum Outcome {
    Committed(ConversationReport),
    Skipped,
    Failed(IngestError),
}

pub struct ConversationProcessor {
    collaborators: Collaborators,
    config: ProcessorConfig,
    units: UnitExtractor,
    ledger: Option<Arc<Mutex<IngestLedger>>>,
}

impl ConversationProcessor {
    pub fn new(collaborators: Collaborators, config: ProcessorConfig) -> Self {
        let units = UnitExtractor::new(config.granularity, config.order);

        Self {
            collaborators,
            config,
            units,
            ledger: None,
        }
    }

    pub fn with_ledger(mut self, ledger: IngestLedger) -> Self {
        self.ledger = Some(Arc::new(Mutex::new(ledger)));
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn reconstruct(&self, raw: &RawConversation) -> Result<ConversationThread> {
        tree::reconstruct(raw, &self.config.reconstruct)
    }

    pub fn extract_metrics(&self, thread: &ConversationThread) -> ThreadMetrics {
        self.collaborators.metrics.extract(thread)
    }

    /// Import every conversation of `location`.
    ///
    /// Malformed records are counted and skipped. The first fatal error stops
    /// scheduling, lets in-flight conversations finish, and is returned as
    /// `RunAborted` with the statistics gathered so far. Cancellation is
    /// honoured between conversations only.
    pub async fn process_import(
        &self,
        importer: &dyn ChatImporter,
        location: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunStats> {
        info!(
            "Validating {} source {}",
            importer.name(),
            location.display()
        );

        if !importer.validate_source(location) {
            return Err(IngestError::InvalidSource {
                importer: importer.name(),
                location: location.to_path_buf(),
            });
        }

        let source = location.display().to_string();
        let run_id = generate_run_id();
        let mut stats = RunStats::start(run_id.clone(), source.as_str());

        if let Some(ledger) = &self.ledger {
            let ledger = ledger.lock().await;
            if self.config.resume {
                report_previous_run(&ledger, &source)?;
            }
            ledger.begin_run(&run_id, &source)?;
        }

        let records = match importer.extract_conversations(location) {
            Ok(records) => records,
            Err(e) => {
                error!("Run {} could not read {}: {}", run_id, source, e);
                stats.finish(RunPhase::Failed);
                self.finish_ledger_run(&stats).await;
                return Err(e);
            }
        };

        info!(
            "Run {} importing {} (concurrency {}, {} writes)",
            run_id,
            source,
            self.config.concurrency.max(1),
            self.config.write_mode.as_str()
        );

        let halt = cancel.child_token();
        let mut fatal: Option<IngestError> = None;

        let mut outcomes = pin!(stream::iter(records.enumerate())
            .take_until(halt.cancelled())
            .map(|(index, record)| self.run_one(index, record, &source, &run_id))
            .buffer_unordered(self.config.concurrency.max(1)));

        while let Some((key, outcome)) = outcomes.next().await {
            match outcome {
                Outcome::Committed(report) => {
                    debug!("Committed {} ({} messages)", key, report.messages);
                    stats.absorb(&report);
                }
                Outcome::Skipped => {
                    debug!("Skipping {}: already committed", key);
                    stats.record_skip();
                }
                Outcome::Failed(e) if e.is_fatal() => {
                    error!("Conversation {} failed fatally: {}", key, e);
                    stats.record_failure(e.to_failure(&key));
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                    halt.cancel();
                }
                Outcome::Failed(e) => {
                    warn!("Skipping conversation {}: {}", key, e);
                    stats.record_failure(e.to_failure(&key));
                }
            }
        }

        // Only a cut made by the caller's token counts; a fatal error cuts
        // through the child token alone
        let interrupted = outcomes.get_ref().get_ref().is_stopped();
        stats.cancelled = interrupted && cancel.is_cancelled();

        if let Some(source_error) = fatal {
            stats.finish(RunPhase::Failed);
            self.finish_ledger_run(&stats).await;
            return Err(IngestError::RunAborted {
                source: Box::new(source_error),
                stats: Box::new(stats),
            });
        }

        stats.finish(RunPhase::Completed);
        self.finish_ledger_run(&stats).await;

        info!(
            "Run {} {}: {} processed, {} skipped, {} failed, {} vectors, {} relationships in {:?}",
            stats.run_id,
            if stats.cancelled { "cancelled" } else { "completed" },
            stats.conversations_processed,
            stats.conversations_skipped,
            stats.conversations_failed,
            stats.vectors_created,
            stats.relationships_created,
            stats.duration.unwrap_or_default()
        );

        Ok(stats)
    }

    async fn finish_ledger_run(&self, stats: &RunStats) {
        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.lock().await.finish_run(stats) {
                warn!("Failed to record run {} in ledger: {}", stats.run_id, e);
            }
        }
    }

    async fn run_one(
        &self,
        index: usize,
        record: Result<RawConversation>,
        source: &str,
        run_id: &RunId,
    ) -> (String, Outcome) {
        let raw = match record {
            Ok(raw) => raw,
            Err(e) => return (format!("#{}", index), Outcome::Failed(e)),
        };

        let key = raw
            .source_id()
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{}", index));

        let checkpoint = self.ledger.as_deref().map(|ledger| Checkpoint {
            ledger,
            source,
            key: &key,
            run_id,
        });

        if self.config.resume {
            if let Some(checkpoint) = &checkpoint {
                let committed = checkpoint.ledger.lock().await.is_committed(source, &key);
                match committed {
                    Ok(true) => return (key, Outcome::Skipped),
                    Ok(false) => {}
                    Err(e) => return (key, Outcome::Failed(e)),
                }
            }
        }

        let mut thread = match self.reconstruct(&raw) {
            Ok(thread) => thread,
            Err(IngestError::MalformedSourceData { reason, .. }) => {
                let err = IngestError::malformed(key.clone(), reason);
                return (key, Outcome::Failed(err));
            }
            Err(e) => return (key, Outcome::Failed(e)),
        };

        let outcome = match self.project(&mut thread, checkpoint.as_ref()).await {
            Ok(report) => Outcome::Committed(report),
            Err(e) => Outcome::Failed(e),
        };

        (key, outcome)
    }

    /// Project one reconstructed thread into both stores. On success every
    /// embedded message carries its vector record id.
    pub async fn process_conversation(
        &self,
        thread: &mut ConversationThread,
    ) -> Result<ConversationReport> {
        self.project(thread, None).await
    }

    async fn project(
        &self,
        thread: &mut ConversationThread,
        checkpoint: Option<&Checkpoint<'_>>,
    ) -> Result<ConversationReport> {
        info!(
            "Processing conversation {} ({:?}, {} messages)",
            thread.id,
            thread.title.as_deref().unwrap_or("Untitled"),
            thread.len()
        );

        let mut report = ConversationReport {
            conversation_id: Some(thread.id.clone()),
            ..Default::default()
        };

        let vector_ids = self.write_vectors(thread, &mut report).await?;
        for (message_id, record_id) in vector_ids {
            if let Some(message) = thread.messages.get_mut(&message_id) {
                message.embedding_id = Some(record_id);
            }
        }
        if let Some(checkpoint) = checkpoint {
            checkpoint.mark(&thread.id, Stage::EmbeddingWrite).await?;
        }

        let written = self.write_graph(thread, &mut report).await?;
        if let Some(checkpoint) = checkpoint {
            checkpoint.mark(&thread.id, Stage::GraphWrite).await?;
        }

        self.link_concepts(thread, &written, &mut report).await;
        if let Some(checkpoint) = checkpoint {
            checkpoint.mark(&thread.id, Stage::ConceptLinking).await?;
        }

        let metrics = self.extract_metrics(thread);
        debug!(
            "Metrics for {}: depth {}, {} branch points, {} leaves",
            thread.id, metrics.max_depth, metrics.branch_points, metrics.leaves
        );

        if let Some(checkpoint) = checkpoint {
            checkpoint.mark(&thread.id, Stage::Committed).await?;
        }

        Ok(report)
    }

    /// Embed and store every semantic unit. Returns message id -> record id
    /// for the message-level units.
    async fn write_vectors(
        &self,
        thread: &ConversationThread,
        report: &mut ConversationReport,
    ) -> Result<HashMap<String, VectorRecordId>> {
        let embedder: &dyn EmbeddingProvider = self.collaborators.embedder.as_ref();
        let vectors: &dyn VectorStore = self.collaborators.vectors.as_ref();
        let collection = self.config.collection.as_str();

        let mut vector_ids = HashMap::new();

        for unit in self.units.units(thread) {
            let text = unit.text.as_str();
            let vector = self
                .config
                .retry
                .run("embedding", move || embedder.embed(text))
                .await
                .map_err(|source| IngestError::EmbeddingFailure {
                    conversation_id: thread.id.to_string(),
                    message_id: unit.metadata.message_id.clone(),
                    source,
                })?;

            let key = match self.config.write_mode {
                WriteMode::Upsert => Some(unit.natural_key()),
                WriteMode::Create => None,
            };
            let key = key.as_deref();

            let mut payload: Payload = match serde_json::to_value(&unit.metadata) {
                Ok(Value::Object(map)) => map,
                Ok(_) => Payload::new(),
                Err(e) => {
                    return Err(store_failure(thread, Stage::EmbeddingWrite, e.into()));
                }
            };
            payload.insert("text".into(), Value::from(unit.text.as_str()));

            let record_id = self
                .write(thread, Stage::EmbeddingWrite, "vector write", move || {
                    vectors.create_point(collection, key, payload.clone(), vector.clone())
                })
                .await?;

            debug!(
                "Stored {} unit {} of {} as {}",
                unit.metadata.unit_type.as_str(),
                unit.metadata.ordinal,
                unit.metadata.message_id,
                record_id
            );

            report.vectors_created += 1;
            if unit.metadata.unit_type == UnitType::Message {
                vector_ids.insert(unit.metadata.message_id.clone(), record_id);
            }
        }

        Ok(vector_ids)
    }

    /// Conversation node, message nodes, then relationships. Returns the ids
    /// of the message nodes written.
    async fn write_graph(
        &self,
        thread: &ConversationThread,
        report: &mut ConversationReport,
    ) -> Result<HashSet<String>> {
        let graph: &dyn GraphStore = self.collaborators.graph.as_ref();

        let mut conversation = Properties::new();
        conversation.insert("id".into(), Value::from(thread.id.0.as_str()));
        if let Some(title) = &thread.title {
            conversation.insert("title".into(), Value::from(title.as_str()));
        }
        if let Some(create_time) = thread.metadata.create_time {
            conversation.insert("create_time".into(), Value::from(create_time));
        }
        if let Some(update_time) = thread.metadata.update_time {
            conversation.insert("update_time".into(), Value::from(update_time));
        }

        self.write(thread, Stage::GraphWrite, "conversation node", move || {
            graph.create_node(CONVERSATION_LABEL, conversation.clone())
        })
        .await?;
        report.nodes_created += 1;

        let ordered: Vec<_> = self.config.order.walk(thread).collect();
        let mut written = HashSet::new();

        for message in &ordered {
            let mut properties = Properties::new();
            properties.insert("id".into(), Value::from(message.id.as_str()));
            properties.insert("content".into(), Value::from(message.content.as_str()));
            properties.insert("role".into(), Value::from(message.role.as_str()));
            properties.insert("timestamp".into(), Value::from(message.timestamp.to_rfc3339()));
            if let Some(record_id) = &message.embedding_id {
                properties.insert("vector_id".into(), Value::from(record_id.0.as_str()));
            }

            self.write(thread, Stage::GraphWrite, "message node", move || {
                graph.create_node(MESSAGE_LABEL, properties.clone())
            })
            .await?;

            report.nodes_created += 1;
            report.messages += 1;
            written.insert(message.id.clone());
        }

        let conversation_match = id_match(&thread.id.0);

        for message in &ordered {
            let message_match = id_match(&message.id);

            let (from, to) = (message_match.clone(), conversation_match.clone());
            self.write(thread, Stage::GraphWrite, "BELONGS_TO", move || {
                graph.create_relationship(
                    MESSAGE_LABEL,
                    from.clone(),
                    BELONGS_TO,
                    CONVERSATION_LABEL,
                    to.clone(),
                )
            })
            .await?;
            report.relationships_created += 1;

            let Some(parent_id) = message.parent_id.as_deref() else {
                continue;
            };
            if !written.contains(parent_id) {
                debug!(
                    "Parent {} of {} was not reached from the root; no REPLIES_TO",
                    parent_id, message.id
                );
                continue;
            }

            let parent_match = id_match(parent_id);
            self.write(thread, Stage::GraphWrite, "REPLIES_TO", move || {
                graph.create_relationship(
                    MESSAGE_LABEL,
                    message_match.clone(),
                    REPLIES_TO,
                    MESSAGE_LABEL,
                    parent_match.clone(),
                )
            })
            .await?;
            report.relationships_created += 1;
        }

        let unreachable = thread.len() - written.len();
        if unreachable > 0 {
            warn!(
                "{} of {} messages in {} are not reachable from root {}",
                unreachable,
                thread.len(),
                thread.id,
                thread.root_id
            );
        }

        Ok(written)
    }

    /// Concept failures are logged and never fail the conversation
    async fn link_concepts(
        &self,
        thread: &ConversationThread,
        written: &HashSet<String>,
        report: &mut ConversationReport,
    ) {
        let extractor = self.collaborators.concepts.as_ref();
        let graph: &dyn GraphStore = self.collaborators.graph.as_ref();
        let mut concept_nodes: HashSet<String> = HashSet::new();

        for message in self.config.order.walk(thread) {
            if !written.contains(&message.id) {
                continue;
            }

            let concepts = match extractor.extract_concepts(message).await {
                Ok(concepts) => concepts,
                Err(e) => {
                    warn!(
                        "{} concept extraction failed for {}: {}",
                        extractor.name(),
                        message.id,
                        e
                    );
                    continue;
                }
            };

            for name in concepts {
                let concept_id = format!("concept:{}", name);

                if !concept_nodes.contains(&concept_id) {
                    let mut properties = Properties::new();
                    properties.insert("id".into(), Value::from(concept_id.as_str()));
                    properties.insert("name".into(), Value::from(name.as_str()));

                    // Concepts are shared across conversations, so always merged
                    if let Err(e) = graph.merge_node(CONCEPT_LABEL, properties).await {
                        warn!("Failed to create concept {}: {}", name, e);
                        continue;
                    }
                    concept_nodes.insert(concept_id.clone());
                    report.nodes_created += 1;
                    report.concepts_extracted += 1;
                }

                match graph
                    .create_relationship(
                        MESSAGE_LABEL,
                        id_match(&message.id),
                        MENTIONS,
                        CONCEPT_LABEL,
                        id_match(&concept_id),
                    )
                    .await
                {
                    Ok(()) => report.relationships_created += 1,
                    Err(e) => warn!("Failed to link {} to concept {}: {}", message.id, name, e),
                }
            }
        }
    }

    /// Store call with retry; exhaustion becomes a `StoreWriteFailure`
    async fn write<T, F, Fut>(
        &self,
        thread: &ConversationThread,
        stage: Stage,
        what: &str,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        self.config
            .retry
            .run(what, operation)
            .await
            .map_err(|source| store_failure(thread, stage, source))
    }
}

fn store_failure(thread: &ConversationThread, stage: Stage, source: StoreError) -> IngestError {
    IngestError::StoreWriteFailure {
        conversation_id: thread.id.to_string(),
        stage,
        source,
    }
}

fn id_match(id: &str) -> Properties {
    let mut properties = Properties::new();
    properties.insert("id".into(), Value::from(id));
    properties
}

/// Log where the last run over `source` stopped before resuming it
fn report_previous_run(ledger: &IngestLedger, source: &str) -> Result<()> {
    let Some((previous, phase)) = ledger.last_run(source)? else {
        return Ok(());
    };

    let incomplete = ledger.incomplete(&previous)?;
    info!(
        "Resuming {} after run {} ({}): {} committed, {} left mid-way",
        source,
        previous,
        phase,
        ledger.committed_count(source)?,
        incomplete.len()
    );
    for (key, stage) in incomplete {
        debug!("{} stopped after {}", key, stage);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_grapher_indexing::{HashEmbedder, InMemoryGraphStore, InMemoryVectorStore};
    use serde_json::json;

    fn three_turns() -> RawConversation {
        serde_json::from_value(json!({
            "title": "Greeting",
            "create_time": 1700000000.0,
            "root": "A",
            "mapping": {
                "A": {"message": {"author": {"role": "user"}, "content": {"parts": ["hi"]}}, "children": ["B"]},
                "B": {"message": {"author": {"role": "assistant"}, "content": {"parts": ["hello"]}}, "children": ["C", "lost"]},
                "C": {"message": {"author": {"role": "user"}, "content": {"parts": ["bye"]}}, "children": []}
            }
        }))
        .unwrap()
    }

    fn processor() -> (
        ConversationProcessor,
        Arc<InMemoryVectorStore>,
        Arc<InMemoryGraphStore>,
    ) {
        let vectors = Arc::new(InMemoryVectorStore::new());
        let graph = Arc::new(InMemoryGraphStore::new());
        let collaborators = Collaborators::new(
            vectors.clone(),
            graph.clone(),
            Arc::new(HashEmbedder::new(8)),
        );
        (
            ConversationProcessor::new(collaborators, ProcessorConfig::default()),
            vectors,
            graph,
        )
    }

    #[tokio::test]
    async fn test_three_message_chain_projection() {
        let (processor, vectors, graph) = processor();
        let mut thread = processor.reconstruct(&three_turns()).unwrap();

        let report = processor.process_conversation(&mut thread).await.unwrap();

        assert_eq!(report.messages, 3);
        assert_eq!(report.vectors_created, 3);
        assert_eq!(report.nodes_created, 4);
        assert_eq!(report.relationships_created, 5);
        assert_eq!(vectors.len("chat_embeddings"), 3);

        assert_eq!(graph.nodes_with_label("Message").len(), 3);
        assert_eq!(graph.relationships_of_type("BELONGS_TO").len(), 3);

        let replies: Vec<(String, String)> = graph
            .relationships_of_type("REPLIES_TO")
            .into_iter()
            .map(|r| {
                (
                    r.from_match["id"].as_str().unwrap().to_string(),
                    r.to_match["id"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(
            replies,
            vec![("B".to_string(), "A".to_string()), ("C".to_string(), "B".to_string())]
        );

        let conversation = graph.find_node("Conversation", &thread.id.0).unwrap();
        assert_eq!(conversation.properties["title"], "Greeting");
        assert_eq!(conversation.properties["create_time"], 1700000000.0);
    }

    #[tokio::test]
    async fn test_graph_links_match_vector_records() {
        let (processor, vectors, graph) = processor();
        let mut thread = processor.reconstruct(&three_turns()).unwrap();
        processor.process_conversation(&mut thread).await.unwrap();

        for message in thread.messages.values() {
            let record_id = message.embedding_id.clone().unwrap();
            let node = graph.find_node("Message", &message.id).unwrap();
            assert_eq!(node.properties["vector_id"], record_id.0.as_str());

            let payload = vectors.payload("chat_embeddings", &record_id).unwrap();
            assert_eq!(payload["message_id"], message.id.as_str());
            assert_eq!(payload["unit_type"], "message");
            assert_eq!(payload["text"], message.content.as_str());
        }
    }

    #[tokio::test]
    async fn test_upsert_mode_converges_on_rerun() {
        let vectors = Arc::new(InMemoryVectorStore::new());
        let graph = Arc::new(InMemoryGraphStore::new().with_merge(true));
        let config = ProcessorConfig {
            write_mode: WriteMode::Upsert,
            reconstruct: ReconstructOptions {
                identity: crate::tree::ThreadIdentity::SourceStable,
                ..Default::default()
            },
            ..Default::default()
        };
        let processor = ConversationProcessor::new(
            Collaborators::new(vectors.clone(), graph.clone(), Arc::new(HashEmbedder::new(8))),
            config,
        );

        let mut raw = three_turns();
        raw.conversation_id = Some("c-1".into());

        for _ in 0..2 {
            let mut thread = processor.reconstruct(&raw).unwrap();
            processor.process_conversation(&mut thread).await.unwrap();
        }

        assert_eq!(vectors.len("chat_embeddings"), 3);
        assert_eq!(graph.nodes_with_label("Message").len(), 3);
        assert_eq!(graph.nodes_with_label("Conversation").len(), 1);
        assert_eq!(graph.relationships_of_type("REPLIES_TO").len(), 2);
    }

    #[tokio::test]
    async fn test_keyword_concepts_are_linked() {
        let vectors = Arc::new(InMemoryVectorStore::new());
        let graph = Arc::new(InMemoryGraphStore::new());
        let collaborators = Collaborators::new(vectors, graph.clone(), Arc::new(HashEmbedder::new(8)))
            .with_concepts(Arc::new(
                crate::extensions::KeywordConceptExtractor::new(2, 1).unwrap(),
            ));
        let processor = ConversationProcessor::new(collaborators, ProcessorConfig::default());

        let raw: RawConversation = serde_json::from_value(json!({
            "mapping": {
                "A": {"message": {"author": {"role": "user"}, "content": {"parts": ["tokio tokio runtime"]}}, "children": ["B"]},
                "B": {"message": {"author": {"role": "assistant"}, "content": {"parts": ["the tokio runtime"]}}}
            }
        }))
        .unwrap();
        let mut thread = processor.reconstruct(&raw).unwrap();
        let report = processor.process_conversation(&mut thread).await.unwrap();

        assert_eq!(report.concepts_extracted, 2);
        assert_eq!(graph.nodes_with_label("Concept").len(), 2);
        assert_eq!(graph.relationships_of_type("MENTIONS").len(), 4);
    }
}
