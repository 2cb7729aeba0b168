use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use lovelock_shared::{ChatMessage, MessageId, ParticipantId};

pub const EVENT_LIVE: &str = "live";
pub const EVENT_BACKFILLED: &str = "backfilled";
pub const EVENT_BACKFILL_FAILED: &str = "backfill-failed";
pub const EVENT_MESSAGE_APPENDED: &str = "message-appended";
pub const EVENT_MESSAGE_REMOVED: &str = "message-removed";
pub const EVENT_CONVERSATION_CLEARED: &str = "conversation-cleared";
pub const EVENT_RECEIPTS_UPDATED: &str = "receipts-updated";
pub const EVENT_INCOMING_ALERT: &str = "incoming-alert";
pub const EVENT_IDLE: &str = "idle";

/// Alert for a newly arrived inbound message. Presentation (sound, desktop
/// notification) is up to the listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomingAlert {
    pub title: String,
    pub body: String,
    pub play_sound: bool,
    pub desktop: bool,
}

/// Everything the session reports to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SessionNotification {
    Live { remote: ParticipantId },
    Backfilled { count: usize },
    BackfillFailed { error: String },
    MessageAppended { message: ChatMessage },
    MessageRemoved { id: MessageId },
    ConversationCleared,
    ReceiptsUpdated {
        receiver: ParticipantId,
        read_at: DateTime<Utc>,
        count: usize,
    },
    IncomingAlert(IncomingAlert),
    Idle,
}

impl SessionNotification {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Live { .. } => EVENT_LIVE,
            Self::Backfilled { .. } => EVENT_BACKFILLED,
            Self::BackfillFailed { .. } => EVENT_BACKFILL_FAILED,
            Self::MessageAppended { .. } => EVENT_MESSAGE_APPENDED,
            Self::MessageRemoved { .. } => EVENT_MESSAGE_REMOVED,
            Self::ConversationCleared => EVENT_CONVERSATION_CLEARED,
            Self::ReceiptsUpdated { .. } => EVENT_RECEIPTS_UPDATED,
            Self::IncomingAlert(_) => EVENT_INCOMING_ALERT,
            Self::Idle => EVENT_IDLE,
        }
    }
}

pub fn emit_event(tx: &mpsc::UnboundedSender<SessionNotification>, notification: SessionNotification) {
    let event = notification.name();
    if tx.send(notification).is_err() {
        tracing::trace!(event, "No notification listener");
    }
}
