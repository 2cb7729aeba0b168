//! CRUD operations for message rows.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::params;
use uuid::Uuid;

use lovelock_shared::{Envelope, MessageId, NewMessage, Pairing, ParticipantId, StoredMessage};

use crate::database::Database;
use crate::error::{Result, StoreError};

const SELECT_COLUMNS: &str =
    "SELECT id, sender_id, receiver_id, content, created_at, delivered_at, read_at FROM messages";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new message and return the stored row, with its assigned
    /// identifier and creation time.
    pub fn insert_message(&self, message: &NewMessage) -> Result<StoredMessage> {
        let stored = StoredMessage {
            id: MessageId::new(),
            sender: message.sender.clone(),
            receiver: message.receiver.clone(),
            content: message.content.clone(),
            // Stored with microsecond precision; truncate so the returned row
            // equals what a later read yields.
            created_at: Utc::now().trunc_subsecs(6),
            delivered_at: None,
            read_at: None,
        };

        self.conn().execute(
            "INSERT INTO messages (id, sender_id, receiver_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                stored.id.to_string(),
                stored.sender.as_str(),
                stored.receiver.as_str(),
                stored.content.as_str(),
                format_ts(&stored.created_at),
            ],
        )?;

        tracing::debug!(msg_id = %stored.id, "message inserted");
        Ok(stored)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// All messages exchanged within a pairing, oldest first.
    pub fn messages_between(&self, pairing: &Pairing) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS}
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at ASC, rowid ASC"
        ))?;

        let rows = stmt.query_map(
            params![pairing.local().as_str(), pairing.remote().as_str()],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn get_message(&self, id: MessageId) -> Result<StoredMessage> {
        self.conn()
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Mark every unread message addressed to `receiver` and created no later
    /// than `at` as read at `at`.
    /// Messages not yet marked delivered are marked delivered at the same time.
    /// Returns the number of rows changed.
    pub fn mark_read(&self, receiver: &ParticipantId, at: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE messages
             SET read_at = ?2,
                 delivered_at = COALESCE(delivered_at, ?2)
             WHERE receiver_id = ?1 AND read_at IS NULL AND created_at <= ?2",
            params![receiver.as_str(), format_ts(&at)],
        )?;
        Ok(affected)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    pub fn delete_message(&self, id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Delete every message of a pairing, in both directions.
    pub fn delete_conversation(&self, pairing: &Pairing) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)",
            params![pairing.local().as_str(), pairing.remote().as_str()],
        )?;
        Ok(affected)
    }
}

// Fixed-width UTC so that lexicographic order in SQLite matches time order.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_ts(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let id_str: String = row.get(0)?;
    let sender: String = row.get(1)?;
    let receiver: String = row.get(2)?;
    let content: String = row.get(3)?;
    let created_str: String = row.get(4)?;
    let delivered_str: Option<String> = row.get(5)?;
    let read_str: Option<String> = row.get(6)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion_error(0, e))?;
    let sender = ParticipantId::new(sender).map_err(|e| conversion_error(1, e))?;
    let receiver = ParticipantId::new(receiver).map_err(|e| conversion_error(2, e))?;

    Ok(StoredMessage {
        id: MessageId(id),
        sender,
        receiver,
        content: Envelope::from_wire(content),
        created_at: parse_ts(4, &created_str)?,
        delivered_at: delivered_str.as_deref().map(|s| parse_ts(5, s)).transpose()?,
        read_at: read_str.as_deref().map(|s| parse_ts(6, s)).transpose()?,
    })
}
