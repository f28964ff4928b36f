/// Message timeline: ordered, deduplicated messages of the active conversation
use crate::types::Message;
use std::collections::HashSet;

/// Messages in client arrival order, unique by `message_id`.
///
/// The id set gives O(1) duplicate checks; the vector keeps iteration order.
#[derive(Debug, Default, Clone)]
pub struct MessageTimeline {
    ids: HashSet<i64>,
    entries: Vec<Message>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole content with a fetched history batch.
    /// Duplicates inside the batch keep their first occurrence.
    pub fn seed(&mut self, messages: Vec<Message>) {
        self.clear();
        for message in messages {
            self.append(message);
        }
    }

    /// Append unless a message with the same id is present.
    /// Returns whether the message was inserted.
    pub fn append(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.message_id) {
            return false;
        }
        self.entries.push(message);
        true
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.entries.clear();
    }

    /// Ordered copy for rendering
    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.clone()
    }

    pub fn contains(&self, message_id: i64) -> bool {
        self.ids.contains(&message_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent entry
    pub fn last(&self) -> Option<&Message> {
        self.entries.last()
    }
}
