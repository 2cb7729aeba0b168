use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use tokio::sync::broadcast;
use tracing::trace;

use lovelock_shared::{MessageId, NewMessage, Pairing, ParticipantId, StoredMessage};
use lovelock_store::Database;

use super::{BackendError, ChangeEvent, ChangeFeed, MessageStore, Subscription};

/// Local backend: a SQLite database plus an in-process change feed.
///
/// Inserts publish [`ChangeEvent::MessageCreated`] and read marking publishes
/// [`ChangeEvent::ReadReceipt`] to every subscriber of this instance.
#[derive(Clone)]
pub struct SqliteBackend {
    db: Arc<Mutex<Database>>,
    feed: broadcast::Sender<ChangeEvent>,
}

impl SqliteBackend {
    pub fn new(db: Database, feed_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            db: Arc::new(Mutex::new(db)),
            feed,
        }
    }

    pub fn open_at(path: &Path, feed_capacity: usize) -> Result<Self, BackendError> {
        Ok(Self::new(Database::open_at(path)?, feed_capacity))
    }

    pub fn open_default(feed_capacity: usize) -> Result<Self, BackendError> {
        Ok(Self::new(Database::open_default()?, feed_capacity))
    }

    pub fn in_memory(feed_capacity: usize) -> Result<Self, BackendError> {
        Ok(Self::new(Database::open_in_memory()?, feed_capacity))
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&Database) -> lovelock_store::Result<T>,
    ) -> Result<T, BackendError> {
        let guard = self
            .db
            .lock()
            .map_err(|e| BackendError::Unavailable(format!("Lock poisoned: {e}")))?;
        Ok(f(&guard)?)
    }

    fn publish(&self, event: ChangeEvent) {
        if self.feed.send(event).is_err() {
            trace!("no change feed subscribers");
        }
    }
}

#[async_trait]
impl MessageStore for SqliteBackend {
    async fn insert_message(&self, message: NewMessage) -> Result<StoredMessage, BackendError> {
        let stored = self.with_db(|db| db.insert_message(&message))?;
        self.publish(ChangeEvent::MessageCreated(stored.clone()));
        Ok(stored)
    }

    async fn fetch_conversation(
        &self,
        pairing: &Pairing,
    ) -> Result<Vec<StoredMessage>, BackendError> {
        self.with_db(|db| db.messages_between(pairing))
    }

    async fn mark_read(&self, reader: &ParticipantId) -> Result<usize, BackendError> {
        let read_at = Utc::now().trunc_subsecs(6);
        let updated = self.with_db(|db| db.mark_read(reader, read_at))?;
        if updated > 0 {
            self.publish(ChangeEvent::ReadReceipt {
                receiver: reader.clone(),
                read_at,
            });
        }
        Ok(updated)
    }

    async fn delete_message(&self, id: MessageId) -> Result<bool, BackendError> {
        self.with_db(|db| db.delete_message(id))
    }

    async fn delete_conversation(&self, pairing: &Pairing) -> Result<usize, BackendError> {
        self.with_db(|db| db.delete_conversation(pairing))
    }
}

#[async_trait]
impl ChangeFeed for SqliteBackend {
    async fn subscribe(&self) -> Result<Subscription, BackendError> {
        Ok(Subscription::new(self.feed.subscribe()))
    }
}
