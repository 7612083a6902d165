use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

// ============================================================================
// ULID and ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

/// Identifier returned by the vector store for a written point
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorRecordId(pub String);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VectorRecordId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Message Schema
// ============================================================================

/// Author role of a message. Sources are not validated against a fixed set,
/// so anything unrecognised is carried verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
    Other(String),
}

impl Role {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "system" => Role::System,
            "tool" => Role::Tool,
            other => Role::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
            Role::Other(raw) => raw,
        }
    }
}

impl From<String> for Role {
    fn from(raw: String) -> Self {
        Role::parse(&raw)
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A node in a conversation tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub role: Role,
    /// Set during tree reconstruction, never by the raw source
    pub parent_id: Option<String>,
    /// Declared child ids in source order, including ids that never resolved
    pub children_ids: Vec<String>,
    /// Source `create_time` when present, otherwise ingestion time
    pub timestamp: DateTime<Utc>,
    pub metadata: Map<String, Value>,
    /// Vector-store record created for this message, once written
    pub embedding_id: Option<VectorRecordId>,
}

impl Message {
    pub fn new(id: impl Into<String>, content: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            role,
            parent_id: None,
            children_ids: Vec::new(),
            timestamp: Utc::now(),
            metadata: Map::new(),
            embedding_id: None,
        }
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.children_ids = children.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

// ============================================================================
// Conversation Thread Schema
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadMetadata {
    /// Epoch seconds, exactly as exported
    pub create_time: Option<f64>,
    pub update_time: Option<f64>,
    pub moderation_results: Vec<Value>,
    pub source_conversation_id: Option<String>,
}

/// One conversation reconstructed as a tree. Owns its messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationThread {
    pub id: ConversationId,
    pub title: Option<String>,
    /// Keyed by message id, in source order
    pub messages: IndexMap<String, Message>,
    pub root_id: String,
    pub metadata: ThreadMetadata,
}

impl ConversationThread {
    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn root(&self) -> Option<&Message> {
        self.messages.get(&self.root_id)
    }

    /// Resolved children of a message in declared order; dangling ids are skipped
    pub fn children_of<'a>(&'a self, message: &'a Message) -> impl Iterator<Item = &'a Message> + 'a {
        message
            .children_ids
            .iter()
            .filter_map(move |child_id| self.messages.get(child_id))
    }
}

// ============================================================================
// Semantic Unit Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitType {
    #[serde(rename = "message")]
    Message,
    #[serde(rename = "paragraph")]
    Paragraph,
    #[serde(rename = "code_block")]
    CodeBlock,
    #[serde(rename = "question_answer")]
    QuestionAnswer,
}

impl UnitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitType::Message => "message",
            UnitType::Paragraph => "paragraph",
            UnitType::CodeBlock => "code_block",
            UnitType::QuestionAnswer => "question_answer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitContext {
    pub title: Option<String>,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitMetadata {
    pub message_id: String,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub unit_type: UnitType,
    /// Position of this unit among the units derived from the same message
    pub ordinal: usize,
    pub context: UnitContext,
}

/// A piece of text plus metadata prepared for embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticUnit {
    pub text: String,
    pub metadata: UnitMetadata,
}

impl SemanticUnit {
    /// Natural key used for idempotent vector writes
    pub fn natural_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.metadata.conversation_id,
            self.metadata.message_id,
            self.metadata.unit_type.as_str(),
            self.metadata.ordinal
        )
    }
}

// ============================================================================
// Raw Export Schema
// ============================================================================

/// One conversation record as found in an export
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawConversation {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub create_time: Option<f64>,
    #[serde(default)]
    pub update_time: Option<f64>,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub mapping: Option<IndexMap<String, RawNode>>,
    #[serde(default)]
    pub moderation_results: Vec<Value>,
}

impl RawConversation {
    /// Identifier the source assigned to this conversation, if any
    pub fn source_id(&self) -> Option<&str> {
        self.conversation_id.as_deref().or(self.id.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawNode {
    #[serde(default)]
    pub message: Option<RawMessage>,
    #[serde(default)]
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub author: RawAuthor,
    #[serde(default)]
    pub create_time: Option<f64>,
    #[serde(default)]
    pub content: RawContent,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAuthor {
    #[serde(default = "default_role")]
    pub role: String,
}

impl Default for RawAuthor {
    fn default() -> Self {
        Self {
            role: default_role(),
        }
    }
}

fn default_role() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawContent {
    #[serde(default)]
    pub content_type: Option<String>,
    /// Fragments in source order; only string fragments carry text
    #[serde(default)]
    pub parts: Vec<Value>,
}

impl RawContent {
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .concat()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

/// Aggregate information about an export source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub source_type: String,
    pub import_time: DateTime<Utc>,
    pub conversation_count: usize,
    pub date_range: DateRange,
}

// ============================================================================
// Run Statistics Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "validating")]
    Validating,
    #[serde(rename = "importing")]
    Importing,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Validating => "validating",
            RunPhase::Importing => "importing",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
        }
    }
}

/// Per-conversation pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "reconstructing")]
    Reconstructing,
    #[serde(rename = "embedding_write")]
    EmbeddingWrite,
    #[serde(rename = "graph_write")]
    GraphWrite,
    #[serde(rename = "concept_linking")]
    ConceptLinking,
    #[serde(rename = "committed")]
    Committed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Reconstructing => "reconstructing",
            Stage::EmbeddingWrite => "embedding_write",
            Stage::GraphWrite => "graph_write",
            Stage::ConceptLinking => "concept_linking",
            Stage::Committed => "committed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "reconstructing" => Some(Stage::Reconstructing),
            "embedding_write" => Some(Stage::EmbeddingWrite),
            "graph_write" => Some(Stage::GraphWrite),
            "concept_linking" => Some(Stage::ConceptLinking),
            "committed" => Some(Stage::Committed),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    #[serde(rename = "malformed_source_data")]
    MalformedSourceData,
    #[serde(rename = "store_write_failure")]
    StoreWriteFailure,
    #[serde(rename = "embedding_failure")]
    EmbeddingFailure,
}

/// A conversation that was skipped or aborted, keyed by conversation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationFailure {
    pub conversation_id: String,
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
}

/// Counts produced by projecting one conversation into both stores
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationReport {
    pub conversation_id: Option<ConversationId>,
    pub messages: usize,
    pub vectors_created: usize,
    pub nodes_created: usize,
    pub relationships_created: usize,
    pub concepts_extracted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub run_id: RunId,
    pub source: String,
    pub phase: RunPhase,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub conversations_processed: usize,
    pub conversations_skipped: usize,
    pub conversations_failed: usize,
    pub messages_processed: usize,
    pub vectors_created: usize,
    pub nodes_created: usize,
    pub relationships_created: usize,
    pub concepts_extracted: usize,
    pub cancelled: bool,
    pub errors: Vec<ConversationFailure>,
}

impl RunStats {
    pub fn start(run_id: RunId, source: impl Into<String>) -> Self {
        Self {
            run_id,
            source: source.into(),
            phase: RunPhase::Importing,
            start_time: Utc::now(),
            end_time: None,
            duration: None,
            conversations_processed: 0,
            conversations_skipped: 0,
            conversations_failed: 0,
            messages_processed: 0,
            vectors_created: 0,
            nodes_created: 0,
            relationships_created: 0,
            concepts_extracted: 0,
            cancelled: false,
            errors: Vec::new(),
        }
    }

    pub fn absorb(&mut self, report: &ConversationReport) {
        self.conversations_processed += 1;
        self.messages_processed += report.messages;
        self.vectors_created += report.vectors_created;
        self.nodes_created += report.nodes_created;
        self.relationships_created += report.relationships_created;
        self.concepts_extracted += report.concepts_extracted;
    }

    pub fn record_failure(&mut self, failure: ConversationFailure) {
        self.conversations_failed += 1;
        self.errors.push(failure);
    }

    pub fn record_skip(&mut self) {
        self.conversations_skipped += 1;
    }

    pub fn finish(&mut self, phase: RunPhase) {
        let end = Utc::now();
        self.phase = phase;
        self.duration = (end - self.start_time).to_std().ok();
        self.end_time = Some(end);
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn generate_conversation_id() -> ConversationId {
    ConversationId(format!("conv_{}", ulid::Ulid::new()))
}

pub fn generate_run_id() -> RunId {
    RunId(format!("run_{}", ulid::Ulid::new()))
}

/// Convert an exported epoch-seconds float into a UTC timestamp
pub fn epoch_to_datetime(epoch: f64) -> Option<DateTime<Utc>> {
    if !epoch.is_finite() {
        return None;
    }
    let secs = epoch.floor() as i64;
    let nanos = ((epoch - epoch.floor()) * 1_000_000_000.0) as u32;
    DateTime::from_timestamp(secs, nanos)
}
