//! Rebuilds a conversation tree from an export's flat node mapping.
//!
//! Two passes: materialize every node that carries a message, then resolve
//! declared children into `parent_id` back-references. Children that never
//! materialized stay in `children_ids` but are otherwise invisible.

use chat_grapher_schemas::{
    epoch_to_datetime, generate_conversation_id, ConversationId, ConversationThread, Message,
    RawConversation, RawNode, Role, ThreadMetadata,
};
use chrono::Utc;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

use crate::error::{IngestError, Result};

/// How the root is chosen when the record declares none
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootPolicy {
    /// Records without a declared root are malformed
    Strict,
    /// First mapping entry in source order
    FirstEntry,
    /// First materialized message in source order that has no parent
    #[default]
    InferParentless,
}

impl RootPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "strict" => Some(RootPolicy::Strict),
            "first_entry" => Some(RootPolicy::FirstEntry),
            "infer_parentless" => Some(RootPolicy::InferParentless),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RootPolicy::Strict => "strict",
            RootPolicy::FirstEntry => "first_entry",
            RootPolicy::InferParentless => "infer_parentless",
        }
    }
}

/// Where the thread id comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadIdentity {
    /// New `conv_<ULID>` on every reconstruction
    #[default]
    Fresh,
    /// `conv_<source id>` when the record carries one, so reruns converge
    SourceStable,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconstructOptions {
    pub root_policy: RootPolicy,
    pub identity: ThreadIdentity,
}

pub fn reconstruct(raw: &RawConversation, options: &ReconstructOptions) -> Result<ConversationThread> {
    let label = raw.source_id().unwrap_or("<unidentified>");

    let mapping = raw
        .mapping
        .as_ref()
        .ok_or_else(|| IngestError::malformed(label, "record has no mapping"))?;

    if mapping.is_empty() {
        return Err(IngestError::malformed(label, "mapping is empty"));
    }

    let mut messages = materialize(mapping);
    if messages.is_empty() {
        return Err(IngestError::malformed(label, "mapping holds no messages"));
    }

    link_parents(&mut messages);

    let root_id = resolve_root(raw, mapping, &messages, options.root_policy)
        .map_err(|reason| IngestError::malformed(label, reason))?;

    let id = match (options.identity, raw.source_id()) {
        (ThreadIdentity::SourceStable, Some(source_id)) => {
            ConversationId(format!("conv_{}", source_id))
        }
        _ => generate_conversation_id(),
    };

    debug!(
        "Reconstructed {} ({} messages, root {})",
        id,
        messages.len(),
        root_id
    );

    Ok(ConversationThread {
        id,
        title: raw.title.clone(),
        messages,
        root_id,
        metadata: ThreadMetadata {
            create_time: raw.create_time,
            update_time: raw.update_time,
            moderation_results: raw.moderation_results.clone(),
            source_conversation_id: raw.source_id().map(str::to_string),
        },
    })
}

fn materialize(mapping: &IndexMap<String, RawNode>) -> IndexMap<String, Message> {
    let ingested_at = Utc::now();

    mapping
        .iter()
        .filter_map(|(node_id, node)| {
            let raw = node.message.as_ref()?;
            let mut metadata = raw.metadata.clone();

            let timestamp = match raw.create_time.and_then(epoch_to_datetime) {
                Some(sent) => {
                    metadata.insert("timestamp_source".into(), Value::from("source"));
                    sent
                }
                None => {
                    metadata.insert("timestamp_source".into(), Value::from("ingested"));
                    ingested_at
                }
            };
            if let Some(content_type) = &raw.content.content_type {
                metadata.insert("content_type".into(), Value::from(content_type.as_str()));
            }

            let message = Message {
                id: node_id.clone(),
                content: raw.content.text(),
                role: Role::parse(&raw.author.role),
                parent_id: None,
                children_ids: node.children.clone(),
                timestamp,
                metadata,
                embedding_id: None,
            };

            Some((node_id.clone(), message))
        })
        .collect()
}

/// Second pass. A child listed by several parents keeps the last one in
/// source order.
fn link_parents(messages: &mut IndexMap<String, Message>) {
    let links: Vec<(String, String)> = messages
        .values()
        .flat_map(|parent| {
            parent
                .children_ids
                .iter()
                .map(move |child| (child.clone(), parent.id.clone()))
        })
        .collect();

    for (child_id, parent_id) in links {
        if let Some(child) = messages.get_mut(&child_id) {
            child.parent_id = Some(parent_id);
        }
    }
}

fn resolve_root(
    raw: &RawConversation,
    mapping: &IndexMap<String, RawNode>,
    messages: &IndexMap<String, Message>,
    policy: RootPolicy,
) -> std::result::Result<String, String> {
    let declared = match (raw.root.as_deref(), policy) {
        (Some(root), _) => root,
        (None, RootPolicy::Strict) => return Err("no root declared".to_string()),
        (None, RootPolicy::FirstEntry) => match mapping.keys().next() {
            Some(first) => first.as_str(),
            None => return Err("mapping is empty".to_string()),
        },
        (None, RootPolicy::InferParentless) => {
            return messages
                .values()
                .find(|message| message.is_root())
                .or_else(|| messages.values().next())
                .map(|message| message.id.clone())
                .ok_or_else(|| "mapping holds no messages".to_string());
        }
    };

    if messages.contains_key(declared) {
        return Ok(declared.to_string());
    }

    if !mapping.contains_key(declared) {
        return Err(format!("root {} is not in the mapping", declared));
    }

    // Structural placeholder: descend to the first node that carries a message
    first_materialized_below(declared, mapping, messages)
        .ok_or_else(|| format!("no message reachable from placeholder root {}", declared))
}

fn first_materialized_below(
    start: &str,
    mapping: &IndexMap<String, RawNode>,
    messages: &IndexMap<String, Message>,
) -> Option<String> {
    let mut queue = VecDeque::from([start]);
    let mut seen = HashSet::from([start]);

    while let Some(node_id) = queue.pop_front() {
        if messages.contains_key(node_id) {
            return Some(node_id.to_string());
        }
        if let Some(node) = mapping.get(node_id) {
            for child in &node.children {
                if seen.insert(child.as_str()) {
                    queue.push_back(child.as_str());
                }
            }
        }
    }

    None
}
