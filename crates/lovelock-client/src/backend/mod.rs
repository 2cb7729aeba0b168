//! Collaborator seams: the message store and its change feed.
//!
//! The session only talks to the backend through [`MessageStore`] and
//! [`ChangeFeed`]. [`SqliteBackend`] implements both over a local database;
//! a hosted backend would convert its JSON rows with
//! [`StoredMessage::from_json`] and push them into a [`Subscription`].

mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use lovelock_shared::error::RowError;
use lovelock_shared::{MessageId, NewMessage, Pairing, ParticipantId, StoredMessage};
use lovelock_store::StoreError;

pub use sqlite::SqliteBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid row from backend: {0}")]
    InvalidRow(#[from] RowError),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Row-level change published by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// A row was inserted into the messages table.
    MessageCreated(StoredMessage),
    /// Every unread message addressed to `receiver` was marked read.
    ReadReceipt {
        receiver: ParticipantId,
        read_at: DateTime<Utc>,
    },
    /// The subscriber fell behind and `skipped` events were lost. Whatever
    /// they carried has to be refetched.
    Lagged { skipped: u64 },
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and return the inserted row.
    async fn insert_message(&self, message: NewMessage) -> Result<StoredMessage, BackendError>;

    /// Every message of the pairing, ordered by creation time ascending.
    async fn fetch_conversation(&self, pairing: &Pairing)
        -> Result<Vec<StoredMessage>, BackendError>;

    /// Mark all unread messages addressed to `reader` as read.
    async fn mark_read(&self, reader: &ParticipantId) -> Result<usize, BackendError>;

    async fn delete_message(&self, id: MessageId) -> Result<bool, BackendError>;

    async fn delete_conversation(&self, pairing: &Pairing) -> Result<usize, BackendError>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a subscription to the messages table. Resolves once the
    /// subscription is established.
    async fn subscribe(&self) -> Result<Subscription, BackendError>;
}

/// Everything a session needs from the outside world.
pub trait Backend: MessageStore + ChangeFeed + 'static {}

impl<T: MessageStore + ChangeFeed + 'static> Backend for T {}

/// Cancellable stream of change events, in arrival order.
#[derive(Debug)]
pub struct Subscription {
    rx: Option<broadcast::Receiver<ChangeEvent>>,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { rx: Some(rx) }
    }

    /// Next event, or `None` once unsubscribed or the feed is gone. Lost
    /// events are reported as [`ChangeEvent::Lagged`].
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        let rx = self.rx.as_mut()?;
        match rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "change feed lagged, events dropped");
                Some(ChangeEvent::Lagged { skipped })
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("change feed closed");
                self.rx = None;
                None
            }
        }
    }

    /// Stop receiving events. Safe to call any number of times.
    pub fn unsubscribe(&mut self) {
        if self.rx.take().is_some() {
            debug!("unsubscribed from change feed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_delivers_in_order() {
        let (tx, rx) = broadcast::channel(8);
        let mut sub = Subscription::new(rx);
        let reader = ParticipantId::new("bob").unwrap();

        for _ in 0..3 {
            tx.send(ChangeEvent::ReadReceipt {
                receiver: reader.clone(),
                read_at: Utc::now(),
            })
            .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            match sub.recv().await {
                Some(ChangeEvent::ReadReceipt { read_at, .. }) => seen.push(read_at),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (tx, rx) = broadcast::channel(8);
        let mut sub = Subscription::new(rx);

        sub.unsubscribe();
        sub.unsubscribe();

        assert!(!sub.is_active());
        assert_eq!(tx.receiver_count(), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_feed_ends_subscription() {
        let (tx, rx) = broadcast::channel::<ChangeEvent>(8);
        let mut sub = Subscription::new(rx);
        drop(tx);

        assert!(sub.recv().await.is_none());
        assert!(!sub.is_active());
    }

    #[tokio::test]
    async fn test_lagged_subscription_keeps_going() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = Subscription::new(rx);
        let reader = ParticipantId::new("bob").unwrap();

        for _ in 0..5 {
            tx.send(ChangeEvent::ReadReceipt {
                receiver: reader.clone(),
                read_at: Utc::now(),
            })
            .unwrap();
        }

        assert_eq!(sub.recv().await, Some(ChangeEvent::Lagged { skipped: 3 }));
        assert!(matches!(sub.recv().await, Some(ChangeEvent::ReadReceipt { .. })));
        assert!(sub.is_active());
    }
}
