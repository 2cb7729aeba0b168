//! Sync state machine for the active pairing.
//!
//! ```text
//! Idle --pair--> Backfilling --key ready--> Live
//!   ^                 |                      |
//!   +---- teardown ---+---------<------------+
//! ```
//!
//! Every mutation is tagged with the [`SyncTicket`] that was handed out when
//! the pairing began. A ticket from an earlier generation is stale: whatever
//! it carries is dropped, so a late response for a previous pairing can never
//! leak into the current log. Merging is by message id, which is what keeps
//! backfill, live events and optimistic sends from producing duplicates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use lovelock_shared::envelope;
use lovelock_shared::{
    ChatMessage, MessageId, NewMessage, Pairing, ParticipantId, SharedKey, StoredMessage,
};

use crate::conversation::ConversationLog;
use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Backfilling,
    Live,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Backfilling => "backfilling",
            Self::Live => "live",
        };
        f.write_str(name)
    }
}

/// Identifies one pairing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTicket {
    generation: u64,
    pairing: Pairing,
}

impl SyncTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pairing(&self) -> &Pairing {
        &self.pairing
    }
}

/// What happened to a message offered to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New message; `inbound` is set when the remote participant sent it.
    Appended { message: ChatMessage, inbound: bool },
    /// Already in the log.
    Duplicate,
    /// Belongs to a different pairing.
    Foreign,
    /// The ticket is out of date or the session is not live.
    Stale,
}

#[derive(Debug, Default)]
pub struct SyncReconciler {
    state: SyncState,
    generation: u64,
    pairing: Option<Pairing>,
    key: Option<SharedKey>,
    /// History fetches started for the current pairing and not yet applied.
    outstanding_fetches: usize,
    log: ConversationLog,
}

impl SyncReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == SyncState::Live
    }

    pub fn pairing(&self) -> Option<&Pairing> {
        self.pairing.as_ref()
    }

    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    /// Start a new pairing: drop everything from the previous one and move
    /// to `Backfilling`.
    pub fn begin(&mut self, pairing: Pairing) -> SyncTicket {
        self.reset();
        self.generation = self.generation.wrapping_add(1);
        self.pairing = Some(pairing.clone());
        self.state = SyncState::Backfilling;
        self.outstanding_fetches = 1;
        SyncTicket {
            generation: self.generation,
            pairing,
        }
    }

    /// Ticket of the active pairing, if any.
    pub fn ticket(&self) -> Option<SyncTicket> {
        self.pairing.as_ref().map(|pairing| SyncTicket {
            generation: self.generation,
            pairing: pairing.clone(),
        })
    }

    pub fn is_current(&self, ticket: &SyncTicket) -> bool {
        self.state != SyncState::Idle
            && ticket.generation == self.generation
            && self.pairing.as_ref() == Some(&ticket.pairing)
    }

    /// The subscription is up and the key is known.
    pub fn go_live(&mut self, ticket: &SyncTicket, key: SharedKey) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        self.key = Some(key);
        self.state = SyncState::Live;
        true
    }

    /// Merge the decrypted history. Returns the number of new entries, or
    /// `None` for a stale ticket.
    pub fn apply_backfill(
        &mut self,
        ticket: &SyncTicket,
        messages: Vec<ChatMessage>,
    ) -> Option<usize> {
        if !self.is_current(ticket) {
            return None;
        }
        self.fetch_done();
        Some(self.log.merge_all(messages))
    }

    /// The history fetch failed; the log keeps what it has.
    pub fn backfill_failed(&mut self, ticket: &SyncTicket) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        self.fetch_done();
        true
    }

    /// Start another history fetch for a live pairing, e.g. after the change
    /// feed dropped events.
    pub fn begin_resync(&mut self, ticket: &SyncTicket) -> bool {
        if !self.is_live() || !self.is_current(ticket) {
            return false;
        }
        self.outstanding_fetches += 1;
        true
    }

    pub fn history_settled(&self) -> bool {
        self.outstanding_fetches == 0
    }

    /// Ticket for a delete. Deletes wait for any outstanding history fetch,
    /// whose rows could otherwise put deleted messages back.
    pub fn delete_ticket(&self) -> Result<SyncTicket> {
        let ticket = self.ticket().ok_or(SessionError::NotPaired)?;
        if !self.history_settled() {
            return Err(SessionError::NotReady);
        }
        Ok(ticket)
    }

    /// Apply a created-row event from the live feed.
    pub fn apply_created(&mut self, ticket: &SyncTicket, stored: StoredMessage) -> MergeOutcome {
        if !self.is_current(ticket) {
            return MergeOutcome::Stale;
        }
        let (Some(pairing), Some(key)) = (&self.pairing, &self.key) else {
            return MergeOutcome::Stale;
        };
        if !pairing.involves(&stored.sender, &stored.receiver) {
            return MergeOutcome::Foreign;
        }
        if self.log.contains(stored.id) {
            return MergeOutcome::Duplicate;
        }

        let inbound = &stored.sender == pairing.remote();
        let message = ChatMessage::open(stored, key);
        self.log.merge(message.clone());
        MergeOutcome::Appended { message, inbound }
    }

    /// Optimistically append a message this client just persisted.
    pub fn apply_sent(&mut self, ticket: &SyncTicket, message: ChatMessage) -> MergeOutcome {
        if !self.is_current(ticket) {
            return MergeOutcome::Stale;
        }
        if self.log.merge(message.clone()) {
            MergeOutcome::Appended {
                message,
                inbound: false,
            }
        } else {
            MergeOutcome::Duplicate
        }
    }

    pub fn apply_read_receipt(
        &mut self,
        ticket: &SyncTicket,
        receiver: &ParticipantId,
        read_at: DateTime<Utc>,
    ) -> usize {
        if !self.is_current(ticket) {
            return 0;
        }
        match &self.pairing {
            Some(p) if p.local() == receiver || p.remote() == receiver => {
                self.log.mark_read(receiver, read_at)
            }
            _ => 0,
        }
    }

    pub fn remove(&mut self, ticket: &SyncTicket, id: MessageId) -> bool {
        self.is_current(ticket) && self.log.remove(id)
    }

    pub fn clear_conversation(&mut self, ticket: &SyncTicket) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        self.log.clear();
        true
    }

    /// Encrypt an outgoing message for the active pairing.
    pub fn seal(&self, plaintext: &str) -> Result<(SyncTicket, NewMessage)> {
        let ticket = self.ticket().ok_or(SessionError::NotPaired)?;
        let key = self.key.as_ref().ok_or(SessionError::NotReady)?;
        let content = envelope::encrypt(key, plaintext)?;
        let message = NewMessage {
            sender: ticket.pairing.local().clone(),
            receiver: ticket.pairing.remote().clone(),
            content,
        };
        Ok((ticket, message))
    }

    /// Back to `Idle`. Outstanding tickets become stale.
    pub fn teardown(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.reset();
    }

    fn reset(&mut self) {
        self.state = SyncState::Idle;
        self.pairing = None;
        self.key = None;
        self.outstanding_fetches = 0;
        self.log.clear();
    }

    fn fetch_done(&mut self) {
        self.outstanding_fetches = self.outstanding_fetches.saturating_sub(1);
    }
}
