//! v001 -- Initial schema creation.
//!
//! Creates the `messages` table and the indexes used by conversation
//! queries and bulk read marking.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    sender_id    TEXT NOT NULL,
    receiver_id  TEXT NOT NULL,
    content      TEXT NOT NULL,               -- envelope: base64(iv):base64(ct)
    created_at   TEXT NOT NULL,               -- RFC-3339, microsecond precision, UTC
    delivered_at TEXT,
    read_at      TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_pair_created
    ON messages(sender_id, receiver_id, created_at);

CREATE INDEX IF NOT EXISTS idx_messages_unread
    ON messages(receiver_id, read_at);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
