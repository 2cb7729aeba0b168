//! Session actor.
//!
//! A single tokio task owns the [`SyncReconciler`], the change-feed
//! [`Subscription`] and the key cache. Callers drive it through a cloneable
//! [`SessionHandle`] and observe it through [`SessionNotification`]s.
//!
//! Key derivation and the history fetch run in a spawned task and report back
//! tagged with the [`SyncTicket`] they were started for, so results that
//! arrive after a re-pair or sign-out are discarded.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use lovelock_shared::constants::NOTIFICATION_TITLE;
use lovelock_shared::{
    decrypt_batch, ChatMessage, KeyCache, KeyDeriver, MessageId, Pairing, ParticipantId, SharedKey,
};

use crate::backend::{Backend, BackendError, ChangeEvent, Subscription};
use crate::error::{Result, SessionError};
use crate::events::{emit_event, IncomingAlert, SessionNotification};
use crate::reconciler::{MergeOutcome, SyncReconciler, SyncState, SyncTicket};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub deriver: KeyDeriver,
    /// Capacity of the command channel.
    pub command_buffer: usize,
    pub sound_enabled: bool,
    pub desktop_notifications: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            deriver: KeyDeriver::default(),
            command_buffer: 64,
            sound_enabled: true,
            desktop_notifications: false,
        }
    }
}

/// Commands sent *to* the session task.
#[derive(Debug)]
enum SessionCommand {
    Pair {
        pairing: Pairing,
        reply: oneshot::Sender<Result<usize>>,
    },
    Send {
        text: String,
        reply: oneshot::Sender<Result<ChatMessage>>,
    },
    DeleteMessage {
        id: MessageId,
        reply: oneshot::Sender<Result<bool>>,
    },
    DeleteConversation {
        reply: oneshot::Sender<Result<usize>>,
    },
    SignOut(oneshot::Sender<()>),
    Messages(oneshot::Sender<Vec<ChatMessage>>),
    State(oneshot::Sender<SyncState>),
    Shutdown,
}

/// Results reported back by background work.
enum TaskEvent {
    KeyDerived {
        ticket: SyncTicket,
        result: Result<SharedKey>,
    },
    Backfilled {
        ticket: SyncTicket,
        result: std::result::Result<Vec<ChatMessage>, BackendError>,
    },
}

/// Cloneable front door to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Pair with `pairing.remote()`, replacing any active pairing. Resolves
    /// once history is loaded and the session is live, with the number of
    /// messages fetched.
    pub async fn pair(&self, pairing: Pairing) -> Result<usize> {
        self.request(|reply| SessionCommand::Pair { pairing, reply })
            .await?
    }

    /// Encrypt, persist and append a message. Surrounding whitespace is
    /// trimmed; empty messages are rejected.
    pub async fn send(&self, text: impl Into<String>) -> Result<ChatMessage> {
        let text = text.into();
        self.request(|reply| SessionCommand::Send { text, reply })
            .await?
    }

    /// Delete one message. Returns whether the backend had it.
    pub async fn delete_message(&self, id: MessageId) -> Result<bool> {
        self.request(|reply| SessionCommand::DeleteMessage { id, reply })
            .await?
    }

    /// Delete the whole conversation in both directions.
    pub async fn delete_conversation(&self) -> Result<usize> {
        self.request(|reply| SessionCommand::DeleteConversation { reply })
            .await?
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.request(SessionCommand::SignOut).await
    }

    /// Snapshot of the conversation log.
    pub async fn messages(&self) -> Result<Vec<ChatMessage>> {
        self.request(SessionCommand::Messages).await
    }

    pub async fn state(&self) -> Result<SyncState> {
        self.request(SessionCommand::State).await
    }

    pub async fn shutdown(&self) {
        if self.cmd_tx.send(SessionCommand::Shutdown).await.is_err() {
            debug!("session already stopped");
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

/// Spawn the session task.
///
/// Returns the handle and the notification receiver. Dropping the receiver
/// is fine; notifications are then discarded.
pub fn spawn_session<B: Backend>(
    backend: Arc<B>,
    config: SessionConfig,
) -> (SessionHandle, mpsc::UnboundedReceiver<SessionNotification>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer.max(1));
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let (task_tx, task_rx) = mpsc::unbounded_channel();

    let actor = SessionActor {
        backend,
        config,
        reconciler: SyncReconciler::new(),
        keys: KeyCache::new(),
        subscription: None,
        pending_pair: None,
        cmd_rx,
        task_tx,
        task_rx,
        notify_tx,
    };
    tokio::spawn(actor.run());

    (SessionHandle { cmd_tx }, notify_rx)
}

struct PendingPair {
    ticket: SyncTicket,
    reply: oneshot::Sender<Result<usize>>,
}

struct SessionActor<B: Backend> {
    backend: Arc<B>,
    config: SessionConfig,
    reconciler: SyncReconciler,
    keys: KeyCache,
    subscription: Option<Subscription>,
    pending_pair: Option<PendingPair>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    task_tx: mpsc::UnboundedSender<TaskEvent>,
    task_rx: mpsc::UnboundedReceiver<TaskEvent>,
    notify_tx: mpsc::UnboundedSender<SessionNotification>,
}

impl<B: Backend> SessionActor<B> {
    async fn run(mut self) {
        info!("Session started");

        loop {
            tokio::select! {
                biased;

                // --- Background results ---
                Some(event) = self.task_rx.recv() => self.on_task_event(event),

                // --- Change feed, only while live ---
                change = next_change(&mut self.subscription), if self.reconciler.is_live() => {
                    match change {
                        Some(event) => self.on_change(event),
                        None => {
                            warn!("Change feed ended, live updates stopped");
                            self.subscription = None;
                        }
                    }
                }

                // --- Incoming commands ---
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Shutdown) | None => break,
                        Some(cmd) => self.on_command(cmd).await,
                    }
                }
            }
        }

        self.teardown("shutdown");
        info!("Session stopped");
    }

    async fn on_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Pair { pairing, reply } => self.start_pairing(pairing, reply).await,
            SessionCommand::Send { text, reply } => {
                let result = self.send(&text).await;
                let _ = reply.send(result);
            }
            SessionCommand::DeleteMessage { id, reply } => {
                let result = self.delete_message(id).await;
                let _ = reply.send(result);
            }
            SessionCommand::DeleteConversation { reply } => {
                let result = self.delete_conversation().await;
                let _ = reply.send(result);
            }
            SessionCommand::SignOut(reply) => {
                self.teardown("signed out");
                self.keys.clear();
                let _ = reply.send(());
            }
            SessionCommand::Messages(reply) => {
                let _ = reply.send(self.reconciler.log().messages().to_vec());
            }
            SessionCommand::State(reply) => {
                let _ = reply.send(self.reconciler.state());
            }
            SessionCommand::Shutdown => {}
        }
    }

    async fn start_pairing(&mut self, pairing: Pairing, reply: oneshot::Sender<Result<usize>>) {
        self.teardown("re-pairing");

        let ticket = self.reconciler.begin(pairing.clone());
        info!(
            local = %pairing.local().short(),
            remote = %pairing.remote().short(),
            generation = ticket.generation(),
            "Pairing"
        );

        match self.backend.subscribe().await {
            Ok(subscription) => self.subscription = Some(subscription),
            Err(e) => {
                error!(error = %e, "Failed to subscribe to change feed");
                self.teardown("subscribe failed");
                let _ = reply.send(Err(e.into()));
                return;
            }
        }

        let cached = self.keys.get(&pairing);
        if cached.is_some() {
            debug!("Using cached shared key");
        }
        tokio::spawn(backfill(
            Arc::clone(&self.backend),
            self.config.deriver,
            ticket.clone(),
            cached,
            self.task_tx.clone(),
        ));

        self.pending_pair = Some(PendingPair { ticket, reply });
    }

    fn on_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::KeyDerived { ticket, result } => {
                if !self.reconciler.is_current(&ticket) {
                    debug!(generation = ticket.generation(), "Discarding key for stale pairing");
                    return;
                }
                match result {
                    Ok(key) => {
                        if self.reconciler.is_live() {
                            return;
                        }
                        self.keys.insert(ticket.pairing(), key.clone());
                        self.reconciler.go_live(&ticket, key);
                        info!(remote = %ticket.pairing().remote().short(), "Session live");
                        self.emit(SessionNotification::Live {
                            remote: ticket.pairing().remote().clone(),
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Shared key derivation failed");
                        let pending = self.take_pending(&ticket);
                        self.teardown("key derivation failed");
                        if let Some(pending) = pending {
                            let _ = pending.reply.send(Err(e));
                        }
                    }
                }
            }
            TaskEvent::Backfilled { ticket, result } => {
                if !self.reconciler.is_current(&ticket) {
                    debug!(generation = ticket.generation(), "Discarding stale history");
                    return;
                }
                let outcome = match result {
                    Ok(messages) => {
                        let fetched = messages.len();
                        let added = self
                            .reconciler
                            .apply_backfill(&ticket, messages)
                            .unwrap_or_default();
                        info!(fetched, added, "History loaded");
                        self.emit(SessionNotification::Backfilled { count: added });
                        self.spawn_mark_read(ticket.pairing().local().clone());
                        Ok(fetched)
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to load history");
                        self.reconciler.backfill_failed(&ticket);
                        self.emit(SessionNotification::BackfillFailed {
                            error: e.to_string(),
                        });
                        Err(SessionError::Backend(e))
                    }
                };
                if let Some(pending) = self.take_pending(&ticket) {
                    let _ = pending.reply.send(outcome);
                }
            }
        }
    }

    fn on_change(&mut self, event: ChangeEvent) {
        let Some(ticket) = self.reconciler.ticket() else {
            return;
        };

        match event {
            ChangeEvent::MessageCreated(stored) => {
                let msg_id = stored.id;
                match self.reconciler.apply_created(&ticket, stored) {
                    MergeOutcome::Appended { message, inbound } => {
                        debug!(msg_id = %msg_id, inbound, "Live message appended");
                        if inbound {
                            if message.decrypted {
                                self.alert(&message);
                            }
                            self.spawn_mark_read(ticket.pairing().local().clone());
                        }
                        self.emit(SessionNotification::MessageAppended { message });
                    }
                    MergeOutcome::Duplicate => {
                        trace!(msg_id = %msg_id, "Live message already in log");
                    }
                    MergeOutcome::Foreign => {
                        trace!(msg_id = %msg_id, "Ignoring message for another pairing");
                    }
                    MergeOutcome::Stale => {
                        debug!(msg_id = %msg_id, "Ignoring live message for stale pairing");
                    }
                }
            }
            ChangeEvent::Lagged { skipped } => {
                warn!(skipped, "Live updates lost, reloading history");
                self.resync(ticket);
            }
            ChangeEvent::ReadReceipt { receiver, read_at } => {
                let count = self
                    .reconciler
                    .apply_read_receipt(&ticket, &receiver, read_at);
                if count > 0 {
                    debug!(receiver = %receiver.short(), count, "Read receipts applied");
                    self.emit(SessionNotification::ReceiptsUpdated {
                        receiver,
                        read_at,
                        count,
                    });
                }
            }
        }
    }

    async fn send(&mut self, text: &str) -> Result<ChatMessage> {
        let plaintext = text.trim();
        if plaintext.is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let (ticket, outgoing) = self.reconciler.seal(plaintext)?;
        let stored = self
            .backend
            .insert_message(outgoing)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to send message");
                e
            })?;

        let message = ChatMessage::from_sent(stored, plaintext.to_string());
        if let MergeOutcome::Appended { message, .. } =
            self.reconciler.apply_sent(&ticket, message.clone())
        {
            info!(msg_id = %message.id, "Message sent");
            self.emit(SessionNotification::MessageAppended { message });
        }
        Ok(message)
    }

    async fn delete_message(&mut self, id: MessageId) -> Result<bool> {
        let ticket = self.reconciler.delete_ticket()?;
        let existed = self.backend.delete_message(id).await.map_err(|e| {
            error!(msg_id = %id, error = %e, "Failed to delete message");
            e
        })?;

        if self.reconciler.remove(&ticket, id) {
            self.emit(SessionNotification::MessageRemoved { id });
        }
        info!(msg_id = %id, existed, "Message deleted");
        Ok(existed)
    }

    async fn delete_conversation(&mut self) -> Result<usize> {
        let ticket = self.reconciler.delete_ticket()?;
        let removed = self
            .backend
            .delete_conversation(ticket.pairing())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to delete conversation");
                e
            })?;

        if self.reconciler.clear_conversation(&ticket) {
            self.emit(SessionNotification::ConversationCleared);
        }
        info!(removed, "Conversation deleted");
        Ok(removed)
    }

    /// Refetch the history of the live pairing. Merging is idempotent, so
    /// only the messages the feed dropped are added.
    fn resync(&mut self, ticket: SyncTicket) {
        let Some(key) = self.keys.get(ticket.pairing()) else {
            return;
        };
        if !self.reconciler.begin_resync(&ticket) {
            return;
        }
        tokio::spawn(backfill(
            Arc::clone(&self.backend),
            self.config.deriver,
            ticket,
            Some(key),
            self.task_tx.clone(),
        ));
    }

    /// Best effort: failures are logged and otherwise ignored.
    fn spawn_mark_read(&self, reader: ParticipantId) {
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            match backend.mark_read(&reader).await {
                Ok(updated) => trace!(updated, "Marked messages read"),
                Err(e) => warn!(error = %e, "Failed to mark messages read"),
            }
        });
    }

    fn alert(&self, message: &ChatMessage) {
        let config = &self.config;
        if !config.sound_enabled && !config.desktop_notifications {
            return;
        }
        self.emit(SessionNotification::IncomingAlert(IncomingAlert {
            title: NOTIFICATION_TITLE.to_string(),
            body: message.body.clone(),
            play_sound: config.sound_enabled,
            desktop: config.desktop_notifications,
        }));
    }

    fn take_pending(&mut self, ticket: &SyncTicket) -> Option<PendingPair> {
        match &self.pending_pair {
            Some(pending) if &pending.ticket == ticket => self.pending_pair.take(),
            _ => None,
        }
    }

    /// Unsubscribe, fail any in-flight pair request and return to `Idle`.
    fn teardown(&mut self, reason: &str) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(pending) = self.pending_pair.take() {
            let _ = pending.reply.send(Err(SessionError::Superseded));
        }
        if self.reconciler.state() != SyncState::Idle {
            self.reconciler.teardown();
            info!(reason, "Session torn down");
            self.emit(SessionNotification::Idle);
        }
    }

    fn emit(&self, notification: SessionNotification) {
        emit_event(&self.notify_tx, notification);
    }
}

async fn next_change(subscription: &mut Option<Subscription>) -> Option<ChangeEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// Derive (or reuse) the pairing key, then fetch and decrypt the history.
async fn backfill<B: Backend>(
    backend: Arc<B>,
    deriver: KeyDeriver,
    ticket: SyncTicket,
    cached: Option<SharedKey>,
    tx: mpsc::UnboundedSender<TaskEvent>,
) {
    let key = match cached {
        Some(key) => key,
        None => {
            let pairing = ticket.pairing().clone();
            let derived = tokio::task::spawn_blocking(move || deriver.derive_for(&pairing)).await;
            match derived {
                Ok(Ok(key)) => key,
                Ok(Err(e)) => {
                    let _ = tx.send(TaskEvent::KeyDerived {
                        ticket,
                        result: Err(e.into()),
                    });
                    return;
                }
                Err(e) => {
                    let _ = tx.send(TaskEvent::KeyDerived {
                        ticket,
                        result: Err(SessionError::Task(e.to_string())),
                    });
                    return;
                }
            }
        }
    };

    let announced = tx.send(TaskEvent::KeyDerived {
        ticket: ticket.clone(),
        result: Ok(key.clone()),
    });
    if announced.is_err() {
        return;
    }

    let result = backend
        .fetch_conversation(ticket.pairing())
        .await
        .map(|rows| decrypt_batch(&key, rows));
    let _ = tx.send(TaskEvent::Backfilled { ticket, result });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use lovelock_shared::constants::DECRYPT_PLACEHOLDER;
    use lovelock_shared::{DeliveryStatus, Envelope, NewMessage, StoredMessage};

    use crate::backend::{ChangeFeed, MessageStore, SqliteBackend};

    type Notifications = mpsc::UnboundedReceiver<SessionNotification>;

    fn config() -> SessionConfig {
        SessionConfig {
            deriver: KeyDeriver::with_iterations(1_000),
            ..SessionConfig::default()
        }
    }

    fn pairing(local: &str, remote: &str) -> Pairing {
        Pairing::from_ids(local, remote).unwrap()
    }

    fn sqlite() -> Arc<SqliteBackend> {
        Arc::new(SqliteBackend::in_memory(64).unwrap())
    }

    async fn next_matching(
        rx: &mut Notifications,
        mut pred: impl FnMut(&SessionNotification) -> bool,
    ) -> Vec<SessionNotification> {
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut seen = Vec::new();
            while let Some(notification) = rx.recv().await {
                let done = pred(&notification);
                seen.push(notification);
                if done {
                    return seen;
                }
            }
            panic!("notification channel closed");
        })
        .await
        .expect("timed out waiting for notification")
    }

    fn bodies(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.body.as_str()).collect()
    }

    #[tokio::test]
    async fn test_commands_before_pairing() {
        let (handle, _notifications) = spawn_session(sqlite(), config());

        assert_eq!(handle.state().await.unwrap(), SyncState::Idle);
        assert!(matches!(handle.send("hi").await, Err(SessionError::NotPaired)));
        assert!(matches!(
            handle.delete_conversation().await,
            Err(SessionError::NotPaired)
        ));
        assert!(handle.messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pair_goes_live_and_rejects_empty_send() {
        let (handle, _notifications) = spawn_session(sqlite(), config());

        assert_eq!(handle.pair(pairing("alice", "bob")).await.unwrap(), 0);
        assert_eq!(handle.state().await.unwrap(), SyncState::Live);
        assert!(matches!(handle.send("   ").await, Err(SessionError::EmptyMessage)));

        let sent = handle.send("  hello  ").await.unwrap();
        assert_eq!(sent.body, "hello");
        assert_eq!(sent.sender.as_str(), "alice");
    }

    #[tokio::test]
    async fn test_own_echo_is_not_duplicated() {
        let (alice, _notifications) = spawn_session(sqlite(), config());
        alice.pair(pairing("alice", "bob")).await.unwrap();

        alice.send("hello").await.unwrap();
        alice.send("again").await.unwrap();

        let messages = alice.messages().await.unwrap();
        assert_eq!(bodies(&messages), vec!["hello", "again"]);
    }

    #[tokio::test]
    async fn test_alice_and_bob_exchange() {
        let backend = sqlite();
        let (alice, mut alice_events) = spawn_session(Arc::clone(&backend), config());
        let (bob, mut bob_events) = spawn_session(Arc::clone(&backend), config());

        alice.pair(pairing("alice", "bob")).await.unwrap();
        alice.send("hello").await.unwrap();

        assert_eq!(bob.pair(pairing("bob", "alice")).await.unwrap(), 1);
        let history = bob.messages().await.unwrap();
        assert_eq!(bodies(&history), vec!["hello"]);
        assert_eq!(history[0].sender.as_str(), "alice");

        alice.send("again").await.unwrap();
        let seen = next_matching(&mut bob_events, |n| {
            matches!(n, SessionNotification::MessageAppended { message } if message.body == "again")
        })
        .await;
        assert!(seen.iter().any(|n| matches!(
            n,
            SessionNotification::IncomingAlert(alert) if alert.body == "again" && alert.play_sound
        )));
        assert_eq!(bodies(&bob.messages().await.unwrap()), vec!["hello", "again"]);

        next_matching(&mut alice_events, |n| {
            matches!(n, SessionNotification::ReceiptsUpdated { receiver, .. } if receiver.as_str() == "bob")
        })
        .await;
        let from_alice = alice.messages().await.unwrap();
        assert_eq!(from_alice[0].status(), DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn test_undecryptable_message_becomes_placeholder_without_alert() {
        let backend = sqlite();
        let (bob, mut bob_events) = spawn_session(Arc::clone(&backend), config());
        bob.pair(pairing("bob", "alice")).await.unwrap();

        backend
            .insert_message(NewMessage {
                sender: ParticipantId::new("alice").unwrap(),
                receiver: ParticipantId::new("bob").unwrap(),
                content: Envelope::from_wire("AAECAwQFBgcICQoL:AAAAAAAAAAAAAAAAAAAAAA=="),
            })
            .await
            .unwrap();

        let seen = next_matching(&mut bob_events, |n| {
            matches!(n, SessionNotification::MessageAppended { .. })
        })
        .await;
        assert!(!seen
            .iter()
            .any(|n| matches!(n, SessionNotification::IncomingAlert(_))));

        let messages = bob.messages().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].decrypted);
        assert_eq!(messages[0].body, DECRYPT_PLACEHOLDER);
    }

    #[tokio::test]
    async fn test_delete_message_survives_backfill() {
        let (alice, _notifications) = spawn_session(sqlite(), config());
        alice.pair(pairing("alice", "bob")).await.unwrap();

        let one = alice.send("one").await.unwrap();
        alice.send("two").await.unwrap();

        assert!(alice.delete_message(one.id).await.unwrap());
        assert!(!alice.delete_message(one.id).await.unwrap());
        assert_eq!(bodies(&alice.messages().await.unwrap()), vec!["two"]);

        assert_eq!(alice.pair(pairing("alice", "bob")).await.unwrap(), 1);
        assert_eq!(bodies(&alice.messages().await.unwrap()), vec!["two"]);
    }

    #[tokio::test]
    async fn test_delete_conversation_then_new_message() {
        let (alice, _notifications) = spawn_session(sqlite(), config());
        alice.pair(pairing("alice", "bob")).await.unwrap();
        alice.send("one").await.unwrap();
        alice.send("two").await.unwrap();

        assert_eq!(alice.delete_conversation().await.unwrap(), 2);
        assert!(alice.messages().await.unwrap().is_empty());

        alice.send("fresh start").await.unwrap();
        assert_eq!(bodies(&alice.messages().await.unwrap()), vec!["fresh start"]);
    }

    #[tokio::test]
    async fn test_sign_out_returns_to_idle() {
        let (alice, mut events) = spawn_session(sqlite(), config());
        alice.pair(pairing("alice", "bob")).await.unwrap();
        alice.send("hello").await.unwrap();

        alice.sign_out().await.unwrap();
        next_matching(&mut events, |n| matches!(n, SessionNotification::Idle)).await;

        assert_eq!(alice.state().await.unwrap(), SyncState::Idle);
        assert!(alice.messages().await.unwrap().is_empty());
        assert!(matches!(alice.send("hi").await, Err(SessionError::NotPaired)));
    }

    #[tokio::test]
    async fn test_closed_after_shutdown() {
        let (handle, _notifications) = spawn_session(sqlite(), config());

        handle.shutdown().await;
        let err = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Err(e) = handle.state().await {
                    return e;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(err, SessionError::Closed));
    }

    /// Delegates to SQLite, with switchable failures and an optional gate on
    /// the first history fetch.
    struct TestBackend {
        inner: SqliteBackend,
        fail_fetch: AtomicBool,
        fail_mark_read: AtomicBool,
        mark_read_calls: AtomicUsize,
        gate_first_fetch: bool,
        fetches: AtomicUsize,
        fetch_entered: Notify,
        release: Notify,
    }

    impl TestBackend {
        fn new() -> Self {
            Self {
                inner: SqliteBackend::in_memory(64).unwrap(),
                fail_fetch: AtomicBool::new(false),
                fail_mark_read: AtomicBool::new(false),
                mark_read_calls: AtomicUsize::new(0),
                gate_first_fetch: false,
                fetches: AtomicUsize::new(0),
                fetch_entered: Notify::new(),
                release: Notify::new(),
            }
        }

        fn gated() -> Self {
            Self {
                gate_first_fetch: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl MessageStore for TestBackend {
        async fn insert_message(
            &self,
            message: NewMessage,
        ) -> std::result::Result<StoredMessage, BackendError> {
            self.inner.insert_message(message).await
        }

        async fn fetch_conversation(
            &self,
            pairing: &Pairing,
        ) -> std::result::Result<Vec<StoredMessage>, BackendError> {
            let nth = self.fetches.fetch_add(1, Ordering::SeqCst);
            // Read before waiting so the gated fetch returns the old rows.
            let rows = self.inner.fetch_conversation(pairing).await;
            if self.gate_first_fetch && nth == 0 {
                self.fetch_entered.notify_one();
                self.release.notified().await;
            }
            if self.fail_fetch.load(Ordering::SeqCst) {
                return Err(BackendError::Unavailable("fetch refused".into()));
            }
            rows
        }

        async fn mark_read(
            &self,
            reader: &ParticipantId,
        ) -> std::result::Result<usize, BackendError> {
            self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_mark_read.load(Ordering::SeqCst) {
                return Err(BackendError::Unavailable("mark read refused".into()));
            }
            self.inner.mark_read(reader).await
        }

        async fn delete_message(&self, id: MessageId) -> std::result::Result<bool, BackendError> {
            self.inner.delete_message(id).await
        }

        async fn delete_conversation(
            &self,
            pairing: &Pairing,
        ) -> std::result::Result<usize, BackendError> {
            self.inner.delete_conversation(pairing).await
        }
    }

    #[async_trait]
    impl ChangeFeed for TestBackend {
        async fn subscribe(&self) -> std::result::Result<Subscription, BackendError> {
            self.inner.subscribe().await
        }
    }

    #[tokio::test]
    async fn test_history_failure_keeps_session_usable() {
        let backend = Arc::new(TestBackend::new());
        backend.fail_fetch.store(true, Ordering::SeqCst);
        let (alice, mut events) = spawn_session(Arc::clone(&backend), config());

        let result = alice.pair(pairing("alice", "bob")).await;
        assert!(matches!(result, Err(SessionError::Backend(_))));
        next_matching(&mut events, |n| matches!(n, SessionNotification::BackfillFailed { .. })).await;

        assert_eq!(alice.state().await.unwrap(), SyncState::Live);
        assert!(alice.messages().await.unwrap().is_empty());
        assert_eq!(alice.send("still here").await.unwrap().body, "still here");
    }

    #[tokio::test]
    async fn test_mark_read_failure_is_ignored() {
        let backend = Arc::new(TestBackend::new());
        backend.fail_mark_read.store(true, Ordering::SeqCst);
        let (bob, mut events) = spawn_session(Arc::clone(&backend), config());
        bob.pair(pairing("bob", "alice")).await.unwrap();

        backend
            .insert_message(NewMessage {
                sender: ParticipantId::new("alice").unwrap(),
                receiver: ParticipantId::new("bob").unwrap(),
                content: lovelock_shared::envelope::encrypt(
                    &config().deriver.derive("alice", "bob").unwrap(),
                    "hi bob",
                )
                .unwrap(),
            })
            .await
            .unwrap();

        next_matching(&mut events, |n| {
            matches!(n, SessionNotification::MessageAppended { message } if message.body == "hi bob")
        })
        .await;
        assert_eq!(bob.state().await.unwrap(), SyncState::Live);
        assert!(backend.mark_read_calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_sign_out_discards_in_flight_history() {
        let backend = Arc::new(TestBackend::gated());
        let (alice, _notifications) = spawn_session(Arc::clone(&backend), config());
        backend
            .insert_message(NewMessage {
                sender: ParticipantId::new("bob").unwrap(),
                receiver: ParticipantId::new("alice").unwrap(),
                content: Envelope::from_wire("iv:ct"),
            })
            .await
            .unwrap();

        let pairing_task = {
            let alice = alice.clone();
            tokio::spawn(async move { alice.pair(pairing("alice", "bob")).await })
        };
        backend.fetch_entered.notified().await;

        alice.sign_out().await.unwrap();
        assert!(matches!(
            pairing_task.await.unwrap(),
            Err(SessionError::Superseded)
        ));

        backend.release.notify_one();
        // Let the released fetch report back before inspecting the log.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(alice.state().await.unwrap(), SyncState::Idle);
        assert!(alice.messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repairing_discards_previous_history() {
        let backend = Arc::new(TestBackend::gated());
        let (alice, _notifications) = spawn_session(Arc::clone(&backend), config());
        let carol_key = config().deriver.derive("alice", "carol").unwrap();
        for (from, to, content) in [
            ("bob", "alice", Envelope::from_wire("iv:ct")),
            (
                "carol",
                "alice",
                lovelock_shared::envelope::encrypt(&carol_key, "hi from carol").unwrap(),
            ),
        ] {
            backend
                .insert_message(NewMessage {
                    sender: ParticipantId::new(from).unwrap(),
                    receiver: ParticipantId::new(to).unwrap(),
                    content,
                })
                .await
                .unwrap();
        }

        let first = {
            let alice = alice.clone();
            tokio::spawn(async move { alice.pair(pairing("alice", "bob")).await })
        };
        backend.fetch_entered.notified().await;

        assert_eq!(alice.pair(pairing("alice", "carol")).await.unwrap(), 1);
        assert!(matches!(first.await.unwrap(), Err(SessionError::Superseded)));

        backend.release.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let messages = alice.messages().await.unwrap();
        assert_eq!(bodies(&messages), vec!["hi from carol"]);
        assert!(messages.iter().all(|m| m.sender.as_str() == "carol"));
    }

    #[tokio::test]
    async fn test_deletes_rejected_while_history_loads() {
        let backend = Arc::new(TestBackend::gated());
        let (alice, _notifications) = spawn_session(Arc::clone(&backend), config());
        let old = backend
            .insert_message(NewMessage {
                sender: ParticipantId::new("bob").unwrap(),
                receiver: ParticipantId::new("alice").unwrap(),
                content: Envelope::from_wire("iv:ct"),
            })
            .await
            .unwrap();

        let pairing_task = {
            let alice = alice.clone();
            tokio::spawn(async move { alice.pair(pairing("alice", "bob")).await })
        };
        backend.fetch_entered.notified().await;

        assert!(matches!(
            alice.delete_conversation().await,
            Err(SessionError::NotReady)
        ));
        assert!(matches!(
            alice.delete_message(old.id).await,
            Err(SessionError::NotReady)
        ));

        backend.release.notify_one();
        assert_eq!(pairing_task.await.unwrap().unwrap(), 1);
        assert_eq!(alice.messages().await.unwrap().len(), 1);

        assert_eq!(alice.delete_conversation().await.unwrap(), 1);
        assert!(alice.messages().await.unwrap().is_empty());
        let stored = backend
            .fetch_conversation(&pairing("alice", "bob"))
            .await
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_lagging_feed_reloads_history() {
        let backend = Arc::new(SqliteBackend::in_memory(2).unwrap());
        let (bob, _notifications) = spawn_session(Arc::clone(&backend), config());
        bob.pair(pairing("bob", "alice")).await.unwrap();

        let key = config().deriver.derive("alice", "bob").unwrap();
        for i in 0..6 {
            backend
                .insert_message(NewMessage {
                    sender: ParticipantId::new("alice").unwrap(),
                    receiver: ParticipantId::new("bob").unwrap(),
                    content: lovelock_shared::envelope::encrypt(&key, &format!("msg {i}")).unwrap(),
                })
                .await
                .unwrap();
        }

        let messages = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let messages = bob.messages().await.unwrap();
                if messages.len() >= 6 {
                    return messages;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("history was not reloaded");

        let mut seen = bodies(&messages);
        seen.sort_unstable();
        let expected: Vec<String> = (0..6).map(|i| format!("msg {i}")).collect();
        assert_eq!(seen, expected);
        assert_eq!(bob.state().await.unwrap(), SyncState::Live);
    }
}
