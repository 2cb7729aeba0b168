//! In-memory conversation log.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use lovelock_shared::{ChatMessage, MessageId, ParticipantId};

/// Decrypted messages of one pairing, ordered by creation time.
///
/// A message id appears at most once no matter how many times it is merged.
/// Messages with equal timestamps keep their arrival order.
#[derive(Debug, Default, Clone)]
pub struct ConversationLog {
    messages: Vec<ChatMessage>,
    ids: HashSet<MessageId>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `message` unless its id is already present. Returns whether the
    /// log changed.
    pub fn merge(&mut self, message: ChatMessage) -> bool {
        if !self.ids.insert(message.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
        true
    }

    /// Merge a batch, returning how many messages were new.
    pub fn merge_all(&mut self, messages: impl IntoIterator<Item = ChatMessage>) -> usize {
        let mut added = 0;
        for message in messages {
            if self.merge(message) {
                added += 1;
            }
        }
        added
    }

    pub fn remove(&mut self, id: MessageId) -> bool {
        if !self.ids.remove(&id) {
            return false;
        }
        self.messages.retain(|m| m.id != id);
        true
    }

    /// Record that `receiver` has read everything addressed to them up to
    /// `read_at`. Returns the number of messages updated.
    pub fn mark_read(&mut self, receiver: &ParticipantId, read_at: DateTime<Utc>) -> usize {
        let mut updated = 0;
        for message in self
            .messages
            .iter_mut()
            .filter(|m| {
                &m.receiver == receiver && m.read_at.is_none() && m.created_at <= read_at
            })
        {
            message.read_at = Some(read_at);
            message.delivered_at.get_or_insert(read_at);
            updated += 1;
        }
        updated
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.ids.contains(&id)
    }

    pub fn get(&self, id: MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
