use chat_grapher_schemas::{DateRange, RawConversation, SourceMetadata};
use chrono::Utc;
use serde_json::Value;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{IngestError, Result};

/// Raw conversation records in source order. A record that cannot be
/// decoded is yielded as an error rather than dropped.
pub type ConversationStream = Box<dyn Iterator<Item = Result<RawConversation>> + Send>;

const CONVERSATIONS_FILE: &str = "conversations.json";

/// A readable chat export
pub trait ChatImporter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap existence and format check. Never fails; a missing or
    /// unreadable source is simply invalid.
    fn validate_source(&self, location: &Path) -> bool;

    /// Records of a validated source. An invalid source is `InvalidSource`.
    fn extract_conversations(&self, location: &Path) -> Result<ConversationStream>;

    fn extract_metadata(&self, location: &Path) -> Result<SourceMetadata>;
}

// ============================================================================
// Export formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    OpenAiNative,
    Json,
    Html,
    Markdown,
}

impl ExportFormat {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "openai_native" | "openai" | "zip" => Ok(ExportFormat::OpenAiNative),
            "json" => Ok(ExportFormat::Json),
            "html" => Ok(ExportFormat::Html),
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            other => Err(IngestError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Guess from the file extension; archives are native exports
    pub fn detect(location: &Path) -> Self {
        match location.extension().and_then(|ext| ext.to_str()) {
            Some("json") => ExportFormat::Json,
            Some("html") | Some("htm") => ExportFormat::Html,
            Some("md") => ExportFormat::Markdown,
            _ => ExportFormat::OpenAiNative,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::OpenAiNative => "openai_native",
            ExportFormat::Json => "json",
            ExportFormat::Html => "html",
            ExportFormat::Markdown => "markdown",
        }
    }

    pub fn importer(&self) -> Box<dyn ChatImporter> {
        match self {
            ExportFormat::OpenAiNative => Box::new(OpenAiExportImporter),
            ExportFormat::Json => Box::new(ConversationsJsonImporter),
            ExportFormat::Html => Box::new(PlaceholderImporter::new("html")),
            ExportFormat::Markdown => Box::new(PlaceholderImporter::new("markdown")),
        }
    }
}

// ============================================================================
// Native export archive
// ============================================================================

/// ChatGPT data export: a zip archive holding `conversations.json`
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAiExportImporter;

impl OpenAiExportImporter {
    fn read_records(&self, location: &Path) -> Result<Vec<Value>> {
        let mut archive = zip::ZipArchive::new(BufReader::new(File::open(location)?))?;

        let entry_name = archive
            .file_names()
            .find(|name| is_conversations_entry(name))
            .map(str::to_string)
            .ok_or_else(|| invalid_source(self.name(), location))?;

        let mut raw = String::new();
        archive.by_name(&entry_name)?.read_to_string(&mut raw)?;

        debug!("Read {} bytes from {}", raw.len(), entry_name);
        parse_records(&raw)
    }
}

impl ChatImporter for OpenAiExportImporter {
    fn name(&self) -> &'static str {
        "openai_native"
    }

    fn validate_source(&self, location: &Path) -> bool {
        if !location.is_file() || location.extension().and_then(|e| e.to_str()) != Some("zip") {
            return false;
        }

        File::open(location)
            .ok()
            .and_then(|file| zip::ZipArchive::new(BufReader::new(file)).ok())
            .map(|archive| archive.file_names().any(is_conversations_entry))
            .unwrap_or(false)
    }

    fn extract_conversations(&self, location: &Path) -> Result<ConversationStream> {
        if !self.validate_source(location) {
            return Err(invalid_source(self.name(), location));
        }

        let records = self.read_records(location)?;
        info!("Found {} conversations in {}", records.len(), location.display());
        Ok(stream(records))
    }

    fn extract_metadata(&self, location: &Path) -> Result<SourceMetadata> {
        if !self.validate_source(location) {
            return Err(invalid_source(self.name(), location));
        }

        Ok(summarize("openai_export", &self.read_records(location)?))
    }
}

fn is_conversations_entry(name: &str) -> bool {
    name == CONVERSATIONS_FILE || name.ends_with("/conversations.json")
}

// ============================================================================
// Bare conversations.json
// ============================================================================

/// An already unpacked `conversations.json`
#[derive(Debug, Default, Clone, Copy)]
pub struct ConversationsJsonImporter;

impl ChatImporter for ConversationsJsonImporter {
    fn name(&self) -> &'static str {
        "json"
    }

    fn validate_source(&self, location: &Path) -> bool {
        location.is_file() && location.extension().and_then(|e| e.to_str()) == Some("json")
    }

    fn extract_conversations(&self, location: &Path) -> Result<ConversationStream> {
        if !self.validate_source(location) {
            return Err(invalid_source(self.name(), location));
        }

        let records = parse_records(&std::fs::read_to_string(location)?)?;
        info!("Found {} conversations in {}", records.len(), location.display());
        Ok(stream(records))
    }

    fn extract_metadata(&self, location: &Path) -> Result<SourceMetadata> {
        if !self.validate_source(location) {
            return Err(invalid_source(self.name(), location));
        }

        let records = parse_records(&std::fs::read_to_string(location)?)?;
        Ok(summarize("conversations_json", &records))
    }
}

// ============================================================================
// Formats without a reader yet
// ============================================================================

/// Registered format with no reader. Never validates.
#[derive(Debug, Clone, Copy)]
pub struct PlaceholderImporter {
    format: &'static str,
}

impl PlaceholderImporter {
    pub fn new(format: &'static str) -> Self {
        Self { format }
    }
}

impl ChatImporter for PlaceholderImporter {
    fn name(&self) -> &'static str {
        self.format
    }

    fn validate_source(&self, _location: &Path) -> bool {
        false
    }

    fn extract_conversations(&self, _location: &Path) -> Result<ConversationStream> {
        Err(IngestError::UnsupportedFormat(self.format.to_string()))
    }

    fn extract_metadata(&self, _location: &Path) -> Result<SourceMetadata> {
        Err(IngestError::UnsupportedFormat(self.format.to_string()))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn invalid_source(importer: &'static str, location: &Path) -> IngestError {
    IngestError::InvalidSource {
        importer,
        location: PathBuf::from(location),
    }
}

fn parse_records(raw: &str) -> Result<Vec<Value>> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Array(records) => Ok(records),
        other => Err(IngestError::malformed(
            CONVERSATIONS_FILE,
            format!("expected an array of conversations, found {}", json_kind(&other)),
        )),
    }
}

fn stream(records: Vec<Value>) -> ConversationStream {
    Box::new(records.into_iter().enumerate().map(|(index, record)| decode(index, record)))
}

fn decode(index: usize, record: Value) -> Result<RawConversation> {
    let mut conversation: RawConversation = serde_json::from_value(record)
        .map_err(|e| IngestError::malformed(format!("#{}", index), e.to_string()))?;

    if conversation.title.is_none() {
        conversation.title = Some("Untitled".to_string());
    }

    Ok(conversation)
}

fn summarize(source_type: &str, records: &[Value]) -> SourceMetadata {
    let create_times: Vec<f64> = records
        .iter()
        .filter_map(|record| record.get("create_time").and_then(Value::as_f64))
        .collect();

    let date_range = DateRange {
        start: create_times.iter().copied().reduce(f64::min),
        end: create_times.iter().copied().reduce(f64::max),
    };

    SourceMetadata {
        source_type: source_type.to_string(),
        import_time: Utc::now(),
        conversation_count: records.len(),
        date_range,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
