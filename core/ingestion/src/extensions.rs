//! Extension points called by the processor: concept extraction and
//! conversation metrics. Both ship a no-op default.

use async_trait::async_trait;
use chat_grapher_schemas::{ConversationId, ConversationThread, Message};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::{IngestError, Result};

// ============================================================================
// Concepts
// ============================================================================

/// Names the topics a message mentions. The processor links each one as
/// `(:Message)-[:MENTIONS]->(:Concept)`; failures are logged and skipped.
#[async_trait]
pub trait ConceptExtractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract_concepts(&self, message: &Message) -> Result<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct NoopConceptExtractor;

#[async_trait]
impl ConceptExtractor for NoopConceptExtractor {
    fn name(&self) -> &str {
        "none"
    }

    async fn extract_concepts(&self, _message: &Message) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

const STOPWORDS: &[&str] = &[
    "the", "and", "that", "this", "with", "from", "have", "would", "there", "could", "should",
    "about", "after", "before", "while", "since", "where", "which", "into", "using", "also",
    "because", "these", "those", "been", "being", "were", "does", "done", "make", "made", "when",
    "then", "than", "your", "their", "them", "they", "what", "ever", "over", "just", "more",
    "only", "each", "such", "very", "much", "like", "onto", "upon", "here", "want", "need",
    "will", "some", "sure", "thanks", "please", "know", "think", "there's", "it's",
];

/// Term-frequency keywords with stop words removed
pub struct KeywordConceptExtractor {
    token: Regex,
    max_concepts: usize,
    min_occurrences: usize,
}

impl KeywordConceptExtractor {
    pub fn new(max_concepts: usize, min_occurrences: usize) -> Result<Self> {
        let token = Regex::new(r"[a-z0-9][a-z0-9_\-]{3,}")
            .map_err(|e| IngestError::Config(format!("keyword pattern: {}", e)))?;

        Ok(Self {
            token,
            max_concepts,
            min_occurrences: min_occurrences.max(1),
        })
    }

    pub fn keywords(&self, content: &str) -> Vec<String> {
        let normalized = content.to_lowercase();
        let mut counts: HashMap<&str, usize> = HashMap::new();

        for found in self.token.find_iter(&normalized) {
            let token = found.as_str().trim_matches(|c: char| !c.is_alphanumeric());
            if token.len() < 4 || token.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            if STOPWORDS.contains(&token) {
                continue;
            }
            *counts.entry(token).or_default() += 1;
        }

        let mut ranked: Vec<(&str, usize)> = counts
            .into_iter()
            .filter(|(_, count)| *count >= self.min_occurrences)
            .collect();
        ranked.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| b.0.len().cmp(&a.0.len()))
                .then_with(|| a.0.cmp(b.0))
        });

        ranked
            .into_iter()
            .take(self.max_concepts)
            .map(|(token, _)| token.to_string())
            .collect()
    }
}

#[async_trait]
impl ConceptExtractor for KeywordConceptExtractor {
    fn name(&self) -> &str {
        "keywords"
    }

    async fn extract_concepts(&self, message: &Message) -> Result<Vec<String>> {
        Ok(self.keywords(&message.content))
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThreadMetrics {
    pub conversation_id: Option<ConversationId>,
    pub message_count: usize,
    /// Messages reachable from the root
    pub reachable: usize,
    pub role_counts: BTreeMap<String, usize>,
    /// Longest root-to-leaf path, counted in messages
    pub max_depth: usize,
    /// Messages with more than one resolved child (edits, regenerations)
    pub branch_points: usize,
    pub leaves: usize,
}

pub trait MetricsExtractor: Send + Sync {
    fn extract(&self, thread: &ConversationThread) -> ThreadMetrics;
}

#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsExtractor for NoopMetrics {
    fn extract(&self, thread: &ConversationThread) -> ThreadMetrics {
        ThreadMetrics {
            conversation_id: Some(thread.id.clone()),
            ..Default::default()
        }
    }
}

/// Shape of the conversation tree
#[derive(Debug, Default)]
pub struct StructuralMetrics;

impl MetricsExtractor for StructuralMetrics {
    fn extract(&self, thread: &ConversationThread) -> ThreadMetrics {
        let mut metrics = ThreadMetrics {
            conversation_id: Some(thread.id.clone()),
            message_count: thread.len(),
            ..Default::default()
        };

        for message in thread.messages.values() {
            *metrics
                .role_counts
                .entry(message.role.as_str().to_string())
                .or_default() += 1;
        }

        let Some(root) = thread.root() else {
            return metrics;
        };

        let mut queue = VecDeque::from([(root, 1usize)]);
        let mut seen = HashSet::from([root.id.as_str()]);

        while let Some((message, depth)) = queue.pop_front() {
            metrics.reachable += 1;
            metrics.max_depth = metrics.max_depth.max(depth);

            let children: Vec<&Message> = thread.children_of(message).collect();
            match children.len() {
                0 => metrics.leaves += 1,
                1 => {}
                _ => metrics.branch_points += 1,
            }

            for child in children {
                if seen.insert(child.id.as_str()) {
                    queue.push_back((child, depth + 1));
                }
            }
        }

        metrics
    }
}
