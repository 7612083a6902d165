use anyhow::Result;
use async_trait::async_trait;
use chat_grapher_indexing::{
    HashEmbedder, InMemoryGraphStore, InMemoryVectorStore, Payload, PayloadFilter, ScoredPoint,
    StoreError, VectorStore,
};
use chat_grapher_ingestion::{
    ChatImporter, Collaborators, ConversationProcessor, ConversationStream, ExportFormat,
    ImportSlot, IngestError, IngestLedger, KeywordConceptExtractor, OpenAiExportImporter,
    ProcessorConfig, ReconstructOptions, RetryPolicy, ThreadIdentity, WriteMode,
};
use chat_grapher_schemas::{FailureKind, RunPhase, SourceMetadata, Stage, VectorRecordId};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use zip::write::SimpleFileOptions;

fn write_export(dir: &Path, conversations: Value) -> PathBuf {
    let path = dir.join("export.zip");
    let mut archive = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
    archive
        .start_file("conversations.json", SimpleFileOptions::default())
        .unwrap();
    archive
        .write_all(conversations.to_string().as_bytes())
        .unwrap();
    archive.finish().unwrap();
    path
}

/// `A -> B -> C` under the given source id, message ids prefixed with it
fn chain(id: &str) -> Value {
    let node = |name: &str| format!("{}-{}", id, name);

    let mut mapping = serde_json::Map::new();
    mapping.insert(
        node("A"),
        json!({"message": {"author": {"role": "user"}, "content": {"parts": ["How do I reverse a list?"]}, "create_time": 1700000000.0}, "children": [node("B")]}),
    );
    mapping.insert(
        node("B"),
        json!({"message": {"author": {"role": "assistant"}, "content": {"parts": ["Call reverse() on it."]}, "create_time": 1700000100.0}, "parent": node("A"), "children": [node("C")]}),
    );
    mapping.insert(
        node("C"),
        json!({"message": {"author": {"role": "user"}, "content": {"parts": ["Thanks!"]}, "create_time": 1700000200.0}, "parent": node("B"), "children": []}),
    );

    json!({
        "id": id,
        "title": format!("Chain {}", id),
        "create_time": 1700000000.0,
        "update_time": 1700000300.0,
        "mapping": mapping
    })
}

struct Harness {
    processor: ConversationProcessor,
    vectors: Arc<InMemoryVectorStore>,
    graph: Arc<InMemoryGraphStore>,
}

fn harness(config: ProcessorConfig) -> Harness {
    let vectors = Arc::new(InMemoryVectorStore::new());
    let graph = Arc::new(InMemoryGraphStore::new());
    let collaborators = Collaborators::new(
        vectors.clone(),
        graph.clone(),
        Arc::new(HashEmbedder::new(16)),
    );

    Harness {
        processor: ConversationProcessor::new(collaborators, config),
        vectors,
        graph,
    }
}

#[tokio::test]
async fn test_import_projects_every_conversation() -> Result<()> {
    let dir = TempDir::new()?;
    let export = write_export(dir.path(), json!([chain("c1"), chain("c2")]));
    let h = harness(ProcessorConfig::default());

    let stats = h
        .processor
        .process_import(&OpenAiExportImporter, &export, &CancellationToken::new())
        .await?;

    assert_eq!(stats.phase, RunPhase::Completed);
    assert_eq!(stats.conversations_processed, 2);
    assert_eq!(stats.messages_processed, 6);
    assert_eq!(stats.vectors_created, 6);
    assert_eq!(stats.nodes_created, 8);
    assert_eq!(stats.relationships_created, 10);
    assert!(stats.errors.is_empty());
    assert!(!stats.cancelled);
    assert!(stats.duration.is_some());

    assert_eq!(h.vectors.len("chat_embeddings"), 6);
    assert_eq!(h.graph.nodes_with_label("Conversation").len(), 2);
    assert_eq!(h.graph.relationships_of_type("REPLIES_TO").len(), 4);

    // Every message node points at a vector record carrying its text
    for node in h.graph.nodes_with_label("Message") {
        let vector_id = node.properties["vector_id"].as_str().unwrap().to_string();
        let payload = h
            .vectors
            .payload("chat_embeddings", &VectorRecordId(vector_id))
            .expect("vector record for message node");
        assert_eq!(payload["message_id"], node.properties["id"]);
        assert_eq!(payload["text"], node.properties["content"]);
    }

    Ok(())
}

#[tokio::test]
async fn test_dangling_child_is_ignored() -> Result<()> {
    let dir = TempDir::new()?;
    let export = write_export(
        dir.path(),
        json!([{
            "id": "dangling",
            "title": "Dangling",
            "mapping": {
                "A": {"message": {"author": {"role": "user"}, "content": {"parts": ["hello"]}}, "children": ["B", "ghost"]},
                "B": {"message": {"author": {"role": "assistant"}, "content": {"parts": ["hi"]}}, "parent": "A", "children": []}
            }
        }]),
    );
    let h = harness(ProcessorConfig::default());

    let stats = h
        .processor
        .process_import(&OpenAiExportImporter, &export, &CancellationToken::new())
        .await?;

    assert_eq!(stats.conversations_processed, 1);
    assert_eq!(stats.messages_processed, 2);
    assert!(stats.errors.is_empty());
    assert_eq!(h.graph.relationships_of_type("REPLIES_TO").len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_malformed_record_is_counted_and_skipped() -> Result<()> {
    let dir = TempDir::new()?;
    let export = write_export(
        dir.path(),
        json!([{"id": "empty", "title": "Nothing here", "mapping": {}}, chain("good")]),
    );
    let h = harness(ProcessorConfig::default());

    let stats = h
        .processor
        .process_import(&OpenAiExportImporter, &export, &CancellationToken::new())
        .await?;

    assert_eq!(stats.phase, RunPhase::Completed);
    assert_eq!(stats.conversations_processed, 1);
    assert_eq!(stats.conversations_failed, 1);
    assert_eq!(stats.errors.len(), 1);
    assert_eq!(stats.errors[0].conversation_id, "empty");
    assert_eq!(stats.errors[0].kind, FailureKind::MalformedSourceData);
    assert_eq!(h.vectors.len("chat_embeddings"), 3);

    Ok(())
}

#[tokio::test]
async fn test_all_malformed_batch_completes_empty() -> Result<()> {
    let dir = TempDir::new()?;
    let export = write_export(
        dir.path(),
        json!([{"id": "e1", "mapping": {}}, {"id": "e2"}]),
    );
    let h = harness(ProcessorConfig::default());

    let stats = h
        .processor
        .process_import(&OpenAiExportImporter, &export, &CancellationToken::new())
        .await?;

    assert_eq!(stats.phase, RunPhase::Completed);
    assert_eq!(stats.conversations_processed, 0);
    assert_eq!(stats.conversations_failed, 2);
    assert_eq!(h.vectors.len("chat_embeddings"), 0);
    assert!(h.graph.nodes().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_invalid_source_processes_nothing() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.zip");
    let h = harness(ProcessorConfig::default());

    let err = h
        .processor
        .process_import(&OpenAiExportImporter, &missing, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::InvalidSource { .. }));
    assert!(h.graph.nodes().is_empty());
}

/// Rejects every write and counts the attempts
#[derive(Default)]
struct RejectingVectorStore {
    attempts: AtomicUsize,
}

#[async_trait]
impl VectorStore for RejectingVectorStore {
    async fn create_point(
        &self,
        _collection: &str,
        _key: Option<&str>,
        _payload: Payload,
        _vector: Vec<f32>,
    ) -> std::result::Result<VectorRecordId, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Rejected("collection is read-only".into()))
    }

    async fn search(
        &self,
        _collection: &str,
        _vector: Vec<f32>,
        _limit: usize,
        _filter: &PayloadFilter,
    ) -> std::result::Result<Vec<ScoredPoint>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_store_failure_aborts_run_with_context() -> Result<()> {
    let dir = TempDir::new()?;
    let export = write_export(dir.path(), json!([chain("c1"), chain("c2"), chain("c3")]));

    let vectors = Arc::new(RejectingVectorStore::default());
    let graph = Arc::new(InMemoryGraphStore::new());
    let collaborators = Collaborators::new(
        vectors.clone(),
        graph.clone(),
        Arc::new(HashEmbedder::new(16)),
    );
    let processor = ConversationProcessor::new(
        collaborators,
        ProcessorConfig {
            retry: RetryPolicy::none(),
            ..Default::default()
        },
    );

    let err = processor
        .process_import(&OpenAiExportImporter, &export, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        IngestError::RunAborted { source, stats } => {
            assert!(matches!(*source, IngestError::StoreWriteFailure { .. }));
            assert_eq!(source.stage(), Stage::EmbeddingWrite);
            assert!(source.conversation().unwrap().starts_with("conv_"));

            assert_eq!(stats.phase, RunPhase::Failed);
            assert_eq!(stats.conversations_processed, 0);
            assert_eq!(stats.conversations_failed, 1);
            assert_eq!(stats.errors[0].kind, FailureKind::StoreWriteFailure);
        }
        other => panic!("expected RunAborted, got {other}"),
    }

    // Later conversations were never scheduled
    assert_eq!(vectors.attempts.load(Ordering::SeqCst), 1);
    assert!(graph.nodes().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_cancelled_before_start_processes_nothing() -> Result<()> {
    let dir = TempDir::new()?;
    let export = write_export(dir.path(), json!([chain("c1"), chain("c2")]));
    let h = harness(ProcessorConfig::default());

    let cancel = CancellationToken::new();
    cancel.cancel();

    let stats = h
        .processor
        .process_import(&OpenAiExportImporter, &export, &cancel)
        .await?;

    assert!(stats.cancelled);
    assert_eq!(stats.phase, RunPhase::Completed);
    assert_eq!(stats.conversations_processed, 0);
    assert_eq!(h.vectors.len("chat_embeddings"), 0);

    Ok(())
}

#[tokio::test]
async fn test_resume_skips_committed_conversations() -> Result<()> {
    let dir = TempDir::new()?;
    let export = write_export(dir.path(), json!([chain("c1"), chain("c2")]));
    let ledger_path = dir.path().join("ledger.db");

    let h = harness(ProcessorConfig {
        resume: true,
        ..Default::default()
    });
    let processor = h.processor.with_ledger(IngestLedger::open(&ledger_path)?);

    let first = processor
        .process_import(&OpenAiExportImporter, &export, &CancellationToken::new())
        .await?;
    assert_eq!(first.conversations_processed, 2);

    let second = processor
        .process_import(&OpenAiExportImporter, &export, &CancellationToken::new())
        .await?;
    assert_eq!(second.conversations_processed, 0);
    assert_eq!(second.conversations_skipped, 2);
    assert_eq!(h.vectors.len("chat_embeddings"), 6);

    let ledger = IngestLedger::open(&ledger_path)?;
    let source = export.display().to_string();
    assert!(ledger.is_committed(&source, "c1")?);
    assert_eq!(ledger.committed_count(&source)?, 2);
    assert_eq!(ledger.run_phase(&second.run_id)?.as_deref(), Some("completed"));

    Ok(())
}

#[tokio::test]
async fn test_concurrent_import_matches_sequential_counts() -> Result<()> {
    let dir = TempDir::new()?;
    let conversations: Vec<Value> = (0..8).map(|i| chain(&format!("c{}", i))).collect();
    let export = write_export(dir.path(), Value::Array(conversations));
    let h = harness(ProcessorConfig {
        concurrency: 4,
        ..Default::default()
    });

    let stats = h
        .processor
        .process_import(&OpenAiExportImporter, &export, &CancellationToken::new())
        .await?;

    assert_eq!(stats.conversations_processed, 8);
    assert_eq!(stats.vectors_created, 24);
    assert_eq!(h.graph.nodes_with_label("Conversation").len(), 8);
    assert_eq!(h.graph.relationships_of_type("BELONGS_TO").len(), 24);

    Ok(())
}

#[tokio::test]
async fn test_upsert_reimport_converges() -> Result<()> {
    let dir = TempDir::new()?;
    let export = write_export(dir.path(), json!([chain("c1")]));

    let vectors = Arc::new(InMemoryVectorStore::new());
    let graph = Arc::new(InMemoryGraphStore::new().with_merge(true));
    let collaborators = Collaborators::new(
        vectors.clone(),
        graph.clone(),
        Arc::new(HashEmbedder::new(16)),
    );
    let processor = ConversationProcessor::new(
        collaborators,
        ProcessorConfig {
            write_mode: WriteMode::Upsert,
            reconstruct: ReconstructOptions {
                identity: ThreadIdentity::SourceStable,
                ..Default::default()
            },
            ..Default::default()
        },
    );

    for _ in 0..2 {
        processor
            .process_import(&OpenAiExportImporter, &export, &CancellationToken::new())
            .await?;
    }

    assert_eq!(vectors.len("chat_embeddings"), 3);
    assert_eq!(graph.nodes_with_label("Conversation").len(), 1);
    assert_eq!(graph.nodes_with_label("Message").len(), 3);

    Ok(())
}

#[tokio::test]
async fn test_detected_json_format_imports() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("conversations.json");
    std::fs::write(&path, json!([chain("c1")]).to_string())?;

    let format = ExportFormat::detect(&path);
    assert_eq!(format, ExportFormat::Json);

    let h = harness(ProcessorConfig::default());
    let stats = h
        .processor
        .process_import(format.importer().as_ref(), &path, &CancellationToken::new())
        .await?;

    assert_eq!(stats.conversations_processed, 1);

    Ok(())
}

/// One user message under the given source id
fn single(id: &str, text: &str) -> Value {
    let mut mapping = serde_json::Map::new();
    mapping.insert(
        format!("{}-A", id),
        json!({"message": {"author": {"role": "user"}, "content": {"parts": [text]}, "create_time": 1700000000.0}, "children": []}),
    );

    json!({"id": id, "title": format!("Single {}", id), "mapping": mapping})
}

#[tokio::test]
async fn test_shared_concept_is_one_node_in_create_mode() -> Result<()> {
    let dir = TempDir::new()?;
    let export = write_export(
        dir.path(),
        json!([single("c1", "tokio tokio"), single("c2", "tokio tokio")]),
    );

    let vectors = Arc::new(InMemoryVectorStore::new());
    let graph = Arc::new(InMemoryGraphStore::new());
    let collaborators = Collaborators::new(
        vectors.clone(),
        graph.clone(),
        Arc::new(HashEmbedder::new(16)),
    )
    .with_concepts(Arc::new(KeywordConceptExtractor::new(5, 1)?));
    let processor = ConversationProcessor::new(collaborators, ProcessorConfig::default());

    let stats = processor
        .process_import(&OpenAiExportImporter, &export, &CancellationToken::new())
        .await?;

    assert_eq!(stats.conversations_processed, 2);
    assert_eq!(graph.nodes_with_label("Concept").len(), 1);
    assert!(graph.find_node("Concept", "concept:tokio").is_some());
    assert_eq!(graph.relationships_of_type("MENTIONS").len(), 2);

    Ok(())
}

/// Native export reader that cancels `token` once `after` records were read,
/// or when the records run out if `after` is `None`
struct CancellingImporter {
    token: CancellationToken,
    after: Option<usize>,
}

impl ChatImporter for CancellingImporter {
    fn name(&self) -> &'static str {
        "cancelling"
    }

    fn validate_source(&self, location: &Path) -> bool {
        OpenAiExportImporter.validate_source(location)
    }

    fn extract_conversations(
        &self,
        location: &Path,
    ) -> chat_grapher_ingestion::Result<ConversationStream> {
        let mut records = OpenAiExportImporter.extract_conversations(location)?;
        let token = self.token.clone();
        let after = self.after;
        let mut read = 0;

        Ok(Box::new(std::iter::from_fn(move || {
            let next = records.next();
            match &next {
                Some(_) => {
                    read += 1;
                    if after == Some(read) {
                        token.cancel();
                    }
                }
                None if after.is_none() => token.cancel(),
                None => {}
            }
            next
        })))
    }

    fn extract_metadata(&self, location: &Path) -> chat_grapher_ingestion::Result<SourceMetadata> {
        OpenAiExportImporter.extract_metadata(location)
    }
}

#[tokio::test]
async fn test_cancel_mid_run_finishes_in_flight_and_stops() -> Result<()> {
    let dir = TempDir::new()?;
    let export = write_export(dir.path(), json!([chain("c1"), chain("c2"), chain("c3")]));
    let h = harness(ProcessorConfig::default());

    let cancel = CancellationToken::new();
    let importer = CancellingImporter {
        token: cancel.clone(),
        after: Some(1),
    };

    let stats = h.processor.process_import(&importer, &export, &cancel).await?;

    assert!(stats.cancelled);
    assert_eq!(stats.phase, RunPhase::Completed);
    assert_eq!(stats.conversations_processed, 1);
    assert_eq!(stats.conversations_failed, 0);
    assert_eq!(h.vectors.len("chat_embeddings"), 3);
    assert_eq!(h.graph.nodes_with_label("Conversation").len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_cancel_after_last_record_is_not_reported() -> Result<()> {
    let dir = TempDir::new()?;
    let export = write_export(dir.path(), json!([chain("c1"), chain("c2")]));
    let h = harness(ProcessorConfig::default());

    let cancel = CancellationToken::new();
    let importer = CancellingImporter {
        token: cancel.clone(),
        after: None,
    };

    let stats = h.processor.process_import(&importer, &export, &cancel).await?;

    assert!(cancel.is_cancelled());
    assert!(!stats.cancelled);
    assert_eq!(stats.conversations_processed, 2);

    Ok(())
}

/// In-memory store that rejects every unit of messages whose id starts with `poison-`
#[derive(Default)]
struct PoisonedVectorStore {
    inner: InMemoryVectorStore,
}

#[async_trait]
impl VectorStore for PoisonedVectorStore {
    async fn create_point(
        &self,
        collection: &str,
        key: Option<&str>,
        payload: Payload,
        vector: Vec<f32>,
    ) -> std::result::Result<VectorRecordId, StoreError> {
        let poisoned = payload
            .get("message_id")
            .and_then(Value::as_str)
            .is_some_and(|id| id.starts_with("poison-"));
        if poisoned {
            return Err(StoreError::Rejected("constraint violation".into()));
        }
        self.inner.create_point(collection, key, payload, vector).await
    }

    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: usize,
        filter: &PayloadFilter,
    ) -> std::result::Result<Vec<ScoredPoint>, StoreError> {
        self.inner.search(collection, vector, limit, filter).await
    }
}

#[tokio::test]
async fn test_fatal_error_with_concurrency_drains_in_flight() -> Result<()> {
    let dir = TempDir::new()?;
    let mut conversations = vec![chain("c0"), chain("poison")];
    conversations.extend((2..12).map(|i| chain(&format!("c{}", i))));
    let export = write_export(dir.path(), Value::Array(conversations));

    let vectors = Arc::new(PoisonedVectorStore::default());
    let graph = Arc::new(InMemoryGraphStore::new());
    let collaborators = Collaborators::new(
        vectors.clone(),
        graph.clone(),
        Arc::new(HashEmbedder::new(16)),
    );
    let processor = ConversationProcessor::new(
        collaborators,
        ProcessorConfig {
            retry: RetryPolicy::none(),
            concurrency: 4,
            ..Default::default()
        },
    );

    let err = processor
        .process_import(&OpenAiExportImporter, &export, &CancellationToken::new())
        .await
        .unwrap_err();

    let (source, stats) = match err {
        IngestError::RunAborted { source, stats } => (source, stats),
        other => panic!("expected RunAborted, got {other}"),
    };
    assert!(matches!(*source, IngestError::StoreWriteFailure { .. }));
    assert_eq!(stats.phase, RunPhase::Failed);
    assert!(!stats.cancelled);
    assert_eq!(stats.conversations_failed, 1);

    // Conversations already in flight were written in full and counted
    assert!(stats.conversations_processed >= 1);
    assert!(stats.conversations_processed < 11);
    assert_eq!(stats.vectors_created, stats.conversations_processed * 3);
    assert_eq!(vectors.inner.len("chat_embeddings"), stats.vectors_created);
    assert_eq!(
        graph.nodes_with_label("Conversation").len(),
        stats.conversations_processed
    );

    Ok(())
}

/// Answers 503 to the first `failures` writes, then stores normally
struct FlakyVectorStore {
    inner: InMemoryVectorStore,
    failures: usize,
    attempts: AtomicUsize,
}

#[async_trait]
impl VectorStore for FlakyVectorStore {
    async fn create_point(
        &self,
        collection: &str,
        key: Option<&str>,
        payload: Payload,
        vector: Vec<f32>,
    ) -> std::result::Result<VectorRecordId, StoreError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(StoreError::Status {
                status: 503,
                body: "service unavailable".into(),
            });
        }
        self.inner.create_point(collection, key, payload, vector).await
    }

    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: usize,
        filter: &PayloadFilter,
    ) -> std::result::Result<Vec<ScoredPoint>, StoreError> {
        self.inner.search(collection, vector, limit, filter).await
    }
}

#[tokio::test]
async fn test_transient_store_errors_are_retried() -> Result<()> {
    let dir = TempDir::new()?;
    let export = write_export(dir.path(), json!([chain("c1"), chain("c2")]));

    let vectors = Arc::new(FlakyVectorStore {
        inner: InMemoryVectorStore::new(),
        failures: 2,
        attempts: AtomicUsize::new(0),
    });
    let collaborators = Collaborators::new(
        vectors.clone(),
        Arc::new(InMemoryGraphStore::new()),
        Arc::new(HashEmbedder::new(16)),
    );
    let processor = ConversationProcessor::new(
        collaborators,
        ProcessorConfig {
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
            ..Default::default()
        },
    );

    let stats = processor
        .process_import(&OpenAiExportImporter, &export, &CancellationToken::new())
        .await?;

    assert_eq!(stats.phase, RunPhase::Completed);
    assert_eq!(stats.conversations_processed, 2);
    assert_eq!(stats.conversations_failed, 0);
    assert_eq!(stats.vectors_created, 6);
    assert_eq!(vectors.inner.len("chat_embeddings"), 6);
    assert_eq!(vectors.attempts.load(Ordering::SeqCst), 8);

    Ok(())
}

#[tokio::test]
async fn test_unreadable_export_marks_run_failed() -> Result<()> {
    let dir = TempDir::new()?;
    let export = write_export(dir.path(), json!({"conversations": []}));
    let ledger_path = dir.path().join("ledger.db");

    let h = harness(ProcessorConfig::default());
    let processor = h.processor.with_ledger(IngestLedger::open(&ledger_path)?);

    let err = processor
        .process_import(&OpenAiExportImporter, &export, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::MalformedSourceData { .. }));

    let ledger = IngestLedger::open(&ledger_path)?;
    let (_, phase) = ledger
        .last_run(&export.display().to_string())?
        .expect("run recorded");
    assert_eq!(phase, "failed");

    Ok(())
}

#[tokio::test]
async fn test_import_slot_runs_one_import_and_frees_itself() -> Result<()> {
    let dir = TempDir::new()?;
    let export = write_export(dir.path(), json!([chain("c1"), chain("c2")]));
    let h = harness(ProcessorConfig::default());
    let processor = Arc::new(h.processor);
    let slot = Arc::new(ImportSlot::new());

    assert!(!slot.cancel().await);

    let running = slot
        .start(processor.clone(), Box::new(OpenAiExportImporter), export.clone())
        .await
        .expect("idle slot accepts an import");
    assert!(slot.is_busy().await);
    assert!(slot
        .start(processor.clone(), Box::new(OpenAiExportImporter), export.clone())
        .await
        .is_none());

    // Nobody waits for the first run; it still completes and frees the slot
    drop(running);
    for _ in 0..200 {
        if !slot.is_busy().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!slot.is_busy().await);
    assert_eq!(h.vectors.len("chat_embeddings"), 6);

    let stats = slot
        .start(processor, Box::new(OpenAiExportImporter), export)
        .await
        .expect("slot free again")
        .await??;
    assert_eq!(stats.conversations_processed, 2);

    Ok(())
}
