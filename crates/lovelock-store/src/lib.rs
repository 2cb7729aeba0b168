//! # lovelock-store
//!
//! SQLite persistence for Love Lock conversations.
//!
//! The store only ever sees envelopes: message bodies are encrypted before
//! they reach it. The crate exposes a synchronous `Database` handle that
//! wraps a `rusqlite::Connection` and provides typed helpers for the
//! messages table.

pub mod database;
pub mod messages;
pub mod migrations;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
