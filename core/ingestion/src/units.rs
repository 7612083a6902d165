use chat_grapher_schemas::{
    ConversationThread, Message, Role, SemanticUnit, UnitContext, UnitMetadata, UnitType,
};

use crate::traversal::TraversalOrder;

/// How finely messages are split into semantic units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitGranularity {
    /// Exactly one unit per message
    #[default]
    Message,
    /// The message unit plus paragraph, code-block and question-answer units
    Fine,
}

impl UnitGranularity {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "message" => Some(UnitGranularity::Message),
            "fine" => Some(UnitGranularity::Fine),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitGranularity::Message => "message",
            UnitGranularity::Fine => "fine",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnitExtractor {
    granularity: UnitGranularity,
    order: TraversalOrder,
}

impl UnitExtractor {
    pub fn new(granularity: UnitGranularity, order: TraversalOrder) -> Self {
        Self { granularity, order }
    }

    pub fn granularity(&self) -> UnitGranularity {
        self.granularity
    }

    /// Units in traversal order. Every message contributes its message unit
    /// first; finer units follow it in the same sequence.
    pub fn units<'a>(
        &'a self,
        thread: &'a ConversationThread,
    ) -> impl Iterator<Item = SemanticUnit> + 'a {
        self.order
            .walk(thread)
            .flat_map(move |message| self.units_for(thread, message))
    }

    pub fn extract(&self, thread: &ConversationThread) -> Vec<SemanticUnit> {
        self.units(thread).collect()
    }

    fn units_for(&self, thread: &ConversationThread, message: &Message) -> Vec<SemanticUnit> {
        let unit = |unit_type: UnitType, ordinal: usize, text: String| SemanticUnit {
            text,
            metadata: UnitMetadata {
                message_id: message.id.clone(),
                conversation_id: thread.id.clone(),
                role: message.role.clone(),
                unit_type,
                ordinal,
                context: UnitContext {
                    title: thread.title.clone(),
                    parent_id: message.parent_id.clone(),
                },
            },
        };

        let mut units = vec![unit(UnitType::Message, 0, message.content.clone())];
        if self.granularity == UnitGranularity::Message {
            return units;
        }

        let (prose, code) = split_code_blocks(&message.content);

        let paragraphs = paragraphs(&prose);
        if paragraphs.len() > 1 {
            units.extend(
                paragraphs
                    .into_iter()
                    .enumerate()
                    .map(|(i, text)| unit(UnitType::Paragraph, i, text)),
            );
        }

        units.extend(
            code.into_iter()
                .enumerate()
                .map(|(i, text)| unit(UnitType::CodeBlock, i, text)),
        );

        if message.role == Role::Assistant {
            let question = message
                .parent_id
                .as_deref()
                .and_then(|parent_id| thread.message(parent_id))
                .filter(|parent| parent.role == Role::User);

            if let Some(question) = question {
                let text = format!("Q: {}\n\nA: {}", question.content, message.content);
                units.push(unit(UnitType::QuestionAnswer, 0, text));
            }
        }

        units
    }
}

/// Separate fenced code from prose. Odd segments between ``` fences are
/// code; a bare word on the fence line is a language tag and is dropped.
fn split_code_blocks(text: &str) -> (String, Vec<String>) {
    if !text.contains("```") {
        return (text.to_string(), Vec::new());
    }

    let mut prose = String::new();
    let mut code = Vec::new();

    for (i, segment) in text.split("```").enumerate() {
        if i % 2 == 0 {
            prose.push_str(segment);
            prose.push_str("\n\n");
            continue;
        }

        let body = match segment.split_once('\n') {
            Some((first, rest))
                if !first.trim().is_empty()
                    && first.trim().chars().all(|c| c.is_alphanumeric() || c == '+' || c == '-') =>
            {
                rest
            }
            _ => segment,
        };

        let body = body.trim_matches('\n');
        if !body.trim().is_empty() {
            code.push(body.to_string());
        }
    }

    (prose, code)
}

fn paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line.trim_end());
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }

    paragraphs
}
