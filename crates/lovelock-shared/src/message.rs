//! Message records at the persistence boundary and their decrypted projection.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{self, Envelope};
use crate::error::RowError;
use crate::kdf::SharedKey;
use crate::types::{MessageId, ParticipantId};

/// An outgoing message, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender: ParticipantId,
    pub receiver: ParticipantId,
    pub content: Envelope,
}

/// A message row as owned by the store. The body is still encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender: ParticipantId,
    pub receiver: ParticipantId,
    pub content: Envelope,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    /// Parse and validate a row delivered as JSON by the hosted backend
    /// (history query result or realtime insert payload).
    pub fn from_json(value: serde_json::Value) -> Result<Self, RowError> {
        let raw: RawMessageRow = serde_json::from_value(value)?;
        Self::try_from(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

/// In-memory, decrypted projection of a [`StoredMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender: ParticipantId,
    pub receiver: ParticipantId,
    /// Plaintext, or [`DECRYPT_PLACEHOLDER`](crate::constants::DECRYPT_PLACEHOLDER) when `decrypted` is false.
    pub body: String,
    pub decrypted: bool,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// Decrypt a stored row. A failure only affects this message: the body
    /// becomes the placeholder and the error is logged.
    pub fn open(stored: StoredMessage, key: &SharedKey) -> Self {
        let (body, decrypted) = envelope::decrypt_or_placeholder(key, &stored.content);
        if !decrypted {
            tracing::warn!(msg_id = %stored.id, "failed to decrypt message");
        }
        Self::with_body(stored, body, decrypted)
    }

    /// Projection of a row this client just inserted, using the plaintext it
    /// already holds. Delivery defaults to the creation time.
    pub fn from_sent(stored: StoredMessage, plaintext: String) -> Self {
        let mut message = Self::with_body(stored, plaintext, true);
        message.delivered_at = message.delivered_at.or(Some(message.created_at));
        message
    }

    fn with_body(stored: StoredMessage, body: String, decrypted: bool) -> Self {
        Self {
            id: stored.id,
            sender: stored.sender,
            receiver: stored.receiver,
            body,
            decrypted,
            created_at: stored.created_at,
            delivered_at: stored.delivered_at,
            read_at: stored.read_at,
        }
    }

    pub fn status(&self) -> DeliveryStatus {
        if self.read_at.is_some() {
            DeliveryStatus::Read
        } else if self.delivered_at.is_some() {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Sent
        }
    }
}

/// Decrypt a batch of rows. Every row is attempted independently.
pub fn decrypt_batch(key: &SharedKey, rows: Vec<StoredMessage>) -> Vec<ChatMessage> {
    rows.into_iter()
        .map(|row| ChatMessage::open(row, key))
        .collect()
}

/// Untyped message row as the hosted backend serialises it. Every field is
/// optional here; [`StoredMessage::try_from`] decides what is acceptable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessageRow {
    pub id: Option<String>,
    pub sender_id: Option<String>,
    pub receiver_id: Option<String>,
    pub content: Option<String>,
    pub created_at: Option<String>,
    pub delivered_at: Option<String>,
    pub read_at: Option<String>,
}

impl TryFrom<RawMessageRow> for StoredMessage {
    type Error = RowError;

    fn try_from(raw: RawMessageRow) -> Result<Self, Self::Error> {
        let id = raw.id.ok_or(RowError::MissingField("id"))?.parse()?;
        let sender = participant("sender_id", raw.sender_id)?;
        let receiver = participant("receiver_id", raw.receiver_id)?;
        let content = Envelope::from_wire(raw.content.ok_or(RowError::MissingField("content"))?);
        let created_at = parse_timestamp(
            "created_at",
            &raw.created_at.ok_or(RowError::MissingField("created_at"))?,
        )?;
        let delivered_at = raw
            .delivered_at
            .map(|s| parse_timestamp("delivered_at", &s))
            .transpose()?;
        let read_at = raw
            .read_at
            .map(|s| parse_timestamp("read_at", &s))
            .transpose()?;

        Ok(Self {
            id,
            sender,
            receiver,
            content,
            created_at,
            delivered_at,
            read_at,
        })
    }
}

fn participant(field: &'static str, value: Option<String>) -> Result<ParticipantId, RowError> {
    let value = value.ok_or(RowError::MissingField(field))?;
    ParticipantId::new(value).map_err(|source| RowError::InvalidParticipant { field, source })
}

// Postgres `timestamptz` comes back as RFC 3339; `timestamp` columns have no offset
// and are treated as UTC.
fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, RowError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| RowError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}
