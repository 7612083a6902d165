use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Mutex;
use tracing::debug;

use crate::error::{Result, StoreError};

pub type Properties = Map<String, Value>;

/// Graph database interface. Relationship endpoints are matched by equality
/// on the supplied properties (typically `id`).
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn create_node(&self, label: &str, properties: Properties) -> Result<()>;

    /// Upsert a node by its `id` property whatever the store's write mode.
    /// Used for nodes shared between conversations.
    async fn merge_node(&self, label: &str, properties: Properties) -> Result<()>;

    async fn create_relationship(
        &self,
        from_label: &str,
        from_match: Properties,
        relation_type: &str,
        to_label: &str,
        to_match: Properties,
    ) -> Result<()>;
}

/// Labels, relationship types and property keys are spliced into queries,
/// so only plain identifiers are accepted.
pub fn validate_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

pub fn properties_from(value: Value) -> Properties {
    match value {
        Value::Object(map) => map,
        _ => Properties::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub label: String,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphRelationship {
    pub from_label: String,
    pub from_match: Properties,
    pub relation_type: String,
    pub to_label: String,
    pub to_match: Properties,
}

#[derive(Default)]
struct GraphState {
    nodes: Vec<GraphNode>,
    relationships: Vec<GraphRelationship>,
}

/// In-memory graph for tests and dry runs. In merge mode nodes are upserted
/// by their `id` property and identical relationships are stored once.
#[derive(Default)]
pub struct InMemoryGraphStore {
    merge: bool,
    state: Mutex<GraphState>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_merge(mut self, merge: bool) -> Self {
        self.merge = merge;
        self
    }

    pub fn nodes(&self) -> Vec<GraphNode> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).nodes.clone()
    }

    pub fn relationships(&self) -> Vec<GraphRelationship> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .relationships
            .clone()
    }

    pub fn nodes_with_label(&self, label: &str) -> Vec<GraphNode> {
        self.nodes().into_iter().filter(|n| n.label == label).collect()
    }

    pub fn relationships_of_type(&self, relation_type: &str) -> Vec<GraphRelationship> {
        self.relationships()
            .into_iter()
            .filter(|r| r.relation_type == relation_type)
            .collect()
    }

    /// First node with `label` whose `id` property equals `id`
    pub fn find_node(&self, label: &str, id: &str) -> Option<GraphNode> {
        self.nodes()
            .into_iter()
            .find(|n| n.label == label && n.properties.get("id").and_then(Value::as_str) == Some(id))
    }
}

fn matches(node: &GraphNode, label: &str, filter: &Properties) -> bool {
    node.label == label && filter.iter().all(|(k, v)| node.properties.get(k) == Some(v))
}

impl InMemoryGraphStore {
    fn insert_node(&self, label: &str, properties: Properties, merge: bool) -> Result<()> {
        validate_identifier(label)?;
        for key in properties.keys() {
            validate_identifier(key)?;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = properties.get("id").cloned();

        if merge {
            if let Some(id) = id {
                if let Some(existing) = state
                    .nodes
                    .iter_mut()
                    .find(|n| n.label == label && n.properties.get("id") == Some(&id))
                {
                    existing.properties.extend(properties);
                    debug!("Merged {} node {}", label, id);
                    return Ok(());
                }
            }
        }

        state.nodes.push(GraphNode {
            label: label.to_string(),
            properties,
        });
        Ok(())
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn create_node(&self, label: &str, properties: Properties) -> Result<()> {
        self.insert_node(label, properties, self.merge)
    }

    async fn merge_node(&self, label: &str, properties: Properties) -> Result<()> {
        self.insert_node(label, properties, true)
    }

    async fn create_relationship(
        &self,
        from_label: &str,
        from_match: Properties,
        relation_type: &str,
        to_label: &str,
        to_match: Properties,
    ) -> Result<()> {
        validate_identifier(from_label)?;
        validate_identifier(relation_type)?;
        validate_identifier(to_label)?;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // Mirrors MATCH semantics: no endpoints, nothing created
        let from_exists = state.nodes.iter().any(|n| matches(n, from_label, &from_match));
        let to_exists = state.nodes.iter().any(|n| matches(n, to_label, &to_match));
        if !from_exists || !to_exists {
            debug!(
                "Skipped {} relationship: endpoint not found ({} -> {})",
                relation_type, from_label, to_label
            );
            return Ok(());
        }

        let relationship = GraphRelationship {
            from_label: from_label.to_string(),
            from_match,
            relation_type: relation_type.to_string(),
            to_label: to_label.to_string(),
            to_match,
        };

        if self.merge && state.relationships.contains(&relationship) {
            return Ok(());
        }

        state.relationships.push(relationship);
        Ok(())
    }
}
