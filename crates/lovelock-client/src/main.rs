//! # lovelock
//!
//! Terminal front end for a Love Lock pairing. Reads the pairing from
//! `LOVELOCK_ME` / `LOVELOCK_PARTNER`, prints the decrypted history, then
//! sends every line typed on stdin.
//!
//! Commands: `/delete <message-id>`, `/clear`, `/quit`.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use lovelock_client::{
    init_tracing, spawn_session, ClientConfig, SessionError, SessionHandle, SessionNotification,
    SqliteBackend,
};
use lovelock_shared::constants::APP_NAME;
use lovelock_shared::{ChatMessage, DeliveryStatus, MessageId};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting {} v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::from_env();
    let pairing = config
        .pairing()
        .context("LOVELOCK_ME and LOVELOCK_PARTNER must name two different people")?;

    let backend = match &config.db_path {
        Some(path) => SqliteBackend::open_at(path, config.feed_capacity),
        None => SqliteBackend::open_default(config.feed_capacity),
    }
    .context("Failed to open message store")?;

    let (session, notifications) = spawn_session(Arc::new(backend), config.session_config());

    println!("💌 {} ↔ {}", pairing.local(), pairing.remote());
    check_pair(session.pair(pairing).await)?;

    let history = session.messages().await?;
    for message in &history {
        println!("{}", render(message));
    }
    let shown: HashSet<MessageId> = history.iter().map(|m| m.id).collect();

    let printer = tokio::spawn(print_notifications(notifications, shown));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !handle_line(&session, line.trim()).await {
            break;
        }
    }

    session.sign_out().await?;
    session.shutdown().await;
    printer.abort();
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_line(session: &SessionHandle, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }

    if line == "/quit" {
        return false;
    }

    if line == "/clear" {
        match session.delete_conversation().await {
            Ok(removed) => println!("🗑  {removed} message(s) deleted"),
            Err(e) => warn!(error = %e, "Clear failed"),
        }
        return true;
    }

    if let Some(arg) = line.strip_prefix("/delete") {
        match arg.parse::<MessageId>() {
            Ok(id) => {
                if let Err(e) = session.delete_message(id).await {
                    warn!(error = %e, "Delete failed");
                }
            }
            Err(_) => println!("usage: /delete <message-id>"),
        }
        return true;
    }

    if let Err(e) = session.send(line).await {
        warn!(error = %e, "Send failed");
    }
    true
}

/// A failed history fetch leaves the session live, so only the other
/// pairing errors end the run.
fn check_pair(result: Result<usize, SessionError>) -> anyhow::Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(SessionError::Backend(e)) => {
            println!("⚠ could not load history: {e}");
            Ok(())
        }
        Err(e) => Err(e).context("Failed to open conversation"),
    }
}

async fn print_notifications(
    mut notifications: mpsc::UnboundedReceiver<SessionNotification>,
    shown: HashSet<MessageId>,
) {
    while let Some(notification) = notifications.recv().await {
        if let Some(line) = notification_line(notification, &shown) {
            println!("{line}");
        }
    }
}

/// Messages in `shown` were already printed with the history.
fn notification_line(
    notification: SessionNotification,
    shown: &HashSet<MessageId>,
) -> Option<String> {
    match notification {
        SessionNotification::MessageAppended { message } if !shown.contains(&message.id) => {
            Some(render(&message))
        }
        SessionNotification::MessageRemoved { id } => Some(format!("🗑  {id}")),
        SessionNotification::ConversationCleared => Some("🗑  conversation cleared".to_string()),
        SessionNotification::IncomingAlert(alert) => {
            let mut line = String::new();
            if alert.play_sound {
                line.push('\x07');
            }
            if alert.desktop {
                line.push_str(&format!("🔔 {}: {}", alert.title, alert.body));
            }
            (!line.is_empty()).then_some(line)
        }
        other => {
            tracing::debug!(event = other.name(), "Session event");
            None
        }
    }
}

fn render(message: &ChatMessage) -> String {
    let ticks = match message.status() {
        DeliveryStatus::Sent => "✓",
        DeliveryStatus::Delivered => "✓✓",
        DeliveryStatus::Read => "✓✓ read",
    };
    format!(
        "[{}] {}: {}  {}  ({})",
        message.created_at.format("%H:%M"),
        message.sender.short(),
        message.body,
        ticks,
        message.id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lovelock_client::BackendError;
    use lovelock_shared::{Envelope, ParticipantId, StoredMessage};

    fn message(body: &str) -> ChatMessage {
        let stored = StoredMessage {
            id: MessageId::new(),
            sender: ParticipantId::new("bob").unwrap(),
            receiver: ParticipantId::new("alice").unwrap(),
            content: Envelope::from_wire("iv:ct"),
            created_at: Utc::now(),
            delivered_at: None,
            read_at: None,
        };
        ChatMessage::from_sent(stored, body.to_string())
    }

    #[test]
    fn test_history_failure_is_not_fatal() {
        let unavailable = BackendError::Unavailable("offline".into());
        assert!(check_pair(Err(SessionError::Backend(unavailable))).is_ok());
        assert!(check_pair(Ok(3)).is_ok());

        assert!(check_pair(Err(SessionError::Superseded)).is_err());
        assert!(check_pair(Err(SessionError::Closed)).is_err());
    }

    #[test]
    fn test_history_messages_print_once() {
        let old = message("from history");
        let new = message("arrived later");
        let shown: HashSet<MessageId> = [old.id].into_iter().collect();

        let replay = SessionNotification::MessageAppended { message: old };
        assert_eq!(notification_line(replay, &shown), None);

        let fresh = SessionNotification::MessageAppended { message: new.clone() };
        assert_eq!(notification_line(fresh, &shown), Some(render(&new)));
    }

    #[test]
    fn test_quiet_alert_prints_nothing() {
        let alert = lovelock_client::IncomingAlert {
            title: "bob".into(),
            body: "hi".into(),
            play_sound: false,
            desktop: false,
        };
        let shown = HashSet::new();
        assert_eq!(notification_line(SessionNotification::IncomingAlert(alert), &shown), None);
    }
}
