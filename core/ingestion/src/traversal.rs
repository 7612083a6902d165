use chat_grapher_schemas::{ConversationThread, Message};
use std::collections::{HashSet, VecDeque};

/// Message ordering used when walking a thread.
///
/// Breadth-first over declared children. This is not send order when a
/// conversation branches (edits, regenerations); consumers that need
/// wall-clock order should sort on `Message::timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraversalOrder {
    #[default]
    BreadthFirst,
}

impl TraversalOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraversalOrder::BreadthFirst => "breadth_first",
        }
    }

    pub fn walk<'a>(&self, thread: &'a ConversationThread) -> BreadthFirst<'a> {
        match self {
            TraversalOrder::BreadthFirst => BreadthFirst::new(thread),
        }
    }
}

/// Lazy breadth-first walk from `root_id`. Ids that do not resolve are
/// skipped and every message is yielded at most once, so cyclic or
/// multi-parent source data still terminates.
pub struct BreadthFirst<'a> {
    thread: &'a ConversationThread,
    queue: VecDeque<&'a str>,
    visited: HashSet<&'a str>,
}

impl<'a> BreadthFirst<'a> {
    pub fn new(thread: &'a ConversationThread) -> Self {
        let mut queue = VecDeque::new();
        let mut visited = HashSet::new();

        if let Some(root) = thread.root() {
            queue.push_back(root.id.as_str());
            visited.insert(root.id.as_str());
        }

        Self {
            thread,
            queue,
            visited,
        }
    }
}

impl<'a> Iterator for BreadthFirst<'a> {
    type Item = &'a Message;

    fn next(&mut self) -> Option<Self::Item> {
        let thread = self.thread;
        let message = thread.message(self.queue.pop_front()?)?;

        for child in thread.children_of(message) {
            if self.visited.insert(child.id.as_str()) {
                self.queue.push_back(child.id.as_str());
            }
        }

        Some(message)
    }
}

pub fn breadth_first(thread: &ConversationThread) -> BreadthFirst<'_> {
    BreadthFirst::new(thread)
}
