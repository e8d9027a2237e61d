//! Per-conversation session tasks and their orchestration.
//!
//! Each open conversation view runs one event-loop task selecting over its
//! command channel, the three realtime feeds, the send-completion channel,
//! and its timers.  The task exclusively owns the message list, typing
//! roster, online list, and profile cache; closing the view aborts the task,
//! so nothing can mutate that state afterwards.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::Utc;
use futures::future;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use palaver_shared::constants::{CHANNEL_CAPACITY, PRESENCE_POLL_INTERVAL, ROOM_HISTORY_LIMIT};
use palaver_shared::models::{Conversation, ConversationKind, MessageRow, NewMessage, Profile, ReadState};
use palaver_shared::protocol::{ReadReceipt, TypingSignal};
use palaver_shared::types::{ConversationId, MediaRef, MessageId, UserId};
use palaver_shared::{ChatError, Result};

use crate::presence::{refresh_online_list, PresenceTracker};
use crate::sync::{ChatEntry, MessageList, Reconciliation};
use crate::typing::{TypingBroadcaster, TypingRoster};
use crate::Services;

// ---------------------------------------------------------------------------
// Commands / notifications / snapshot
// ---------------------------------------------------------------------------

/// Commands sent *into* a session task.
enum SessionCommand {
    Send {
        content: String,
        media: Option<MediaRef>,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    MarkRead {
        ids: Vec<MessageId>,
        reply: oneshot::Sender<Result<()>>,
    },
    InputChanged,
    Reload {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Notifications sent *from* a session task to the view that opened it.
#[derive(Debug, Clone)]
pub enum SessionNotification {
    /// An optimistic send could not be persisted and was rolled back.
    SendFailed {
        message_id: MessageId,
        reason: String,
    },
    /// A reload failed; the previous state is still shown.
    LoadFailed { reason: String },
}

/// Read-only view of one conversation's state for rendering.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    pub messages: Vec<ChatEntry>,
    pub typing_users: Vec<UserId>,
    pub online_users: Vec<Profile>,
}

/// Outcome of one spawned message persist, reported back into the loop.
struct SendOutcome {
    message_id: MessageId,
    result: Result<()>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to one open conversation view.
///
/// All methods go through the session task's command channel; once the view
/// is closed they fail with [`ChatError::Closed`].
pub struct ChatHandle {
    conversation: ConversationId,
    cmd_tx: mpsc::Sender<SessionCommand>,
    snapshot_rx: watch::Receiver<ChatSnapshot>,
    notif_rx: mpsc::Receiver<SessionNotification>,
}

impl ChatHandle {
    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    /// Send a message.  Returns as soon as the optimistic entry is visible;
    /// persistence continues in the background and a failure arrives as a
    /// [`SessionNotification::SendFailed`].
    pub async fn send(&self, content: impl Into<String>, media: Option<MediaRef>) -> Result<MessageId> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Send {
                content: content.into(),
                media,
                reply,
            })
            .await
            .map_err(|_| ChatError::Closed)?;
        response.await.map_err(|_| ChatError::Closed)?
    }

    /// Mark messages as read by the local user and broadcast the receipt.
    pub async fn mark_read(&self, ids: Vec<MessageId>) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::MarkRead { ids, reply })
            .await
            .map_err(|_| ChatError::Closed)?;
        response.await.map_err(|_| ChatError::Closed)?
    }

    /// Forward a keystroke; the task throttles the outgoing typing signal.
    pub async fn input_changed(&self) -> Result<()> {
        self.cmd_tx
            .send(SessionCommand::InputChanged)
            .await
            .map_err(|_| ChatError::Closed)
    }

    /// Re-fetch the history.  The previous state survives a failure.
    pub async fn reload(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Reload { reply })
            .await
            .map_err(|_| ChatError::Closed)?;
        response.await.map_err(|_| ChatError::Closed)?
    }

    /// Current state of the view.
    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch channel yielding a fresh [`ChatSnapshot`] after every change.
    pub fn watch(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Next error notification, or `None` once the session is gone.
    pub async fn next_notification(&mut self) -> Option<SessionNotification> {
        self.notif_rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct OpenSession {
    task: JoinHandle<()>,
}

/// Manages the set of simultaneously open conversation views, one session
/// task per conversation.
pub struct ChatSessions {
    services: Services,
    user: UserId,
    open: HashMap<ConversationId, OpenSession>,
}

impl ChatSessions {
    pub fn new(services: Services, user: UserId) -> Self {
        Self {
            services,
            user,
            open: HashMap::new(),
        }
    }

    /// Open a conversation view: validate access, subscribe the feeds, load
    /// the history, and spawn the session task.
    pub async fn open(&mut self, conversation: ConversationId) -> Result<ChatHandle> {
        let services = self.services.clone();
        let user = self.user;

        match self.open.entry(conversation) {
            Entry::Occupied(_) => Err(ChatError::InvalidArgument(
                "conversation is already open".into(),
            )),
            Entry::Vacant(slot) => {
                let conversation = services.store.conversation(conversation).await?;
                let participants = match conversation.kind {
                    ConversationKind::Direct => {
                        let participants =
                            services.store.participants(conversation.id).await?;
                        if !participants.contains(&user) {
                            return Err(ChatError::PermissionDenied);
                        }
                        participants
                    }
                    ConversationKind::Room => Vec::new(),
                };

                let (handle, task) =
                    SessionScope::spawn(services, user, conversation, participants).await?;
                slot.insert(OpenSession { task });
                Ok(handle)
            }
        }
    }

    pub fn is_open(&self, conversation: ConversationId) -> bool {
        self.open.contains_key(&conversation)
    }

    pub fn open_conversations(&self) -> Vec<ConversationId> {
        self.open.keys().copied().collect()
    }

    /// Tear down one view: the task is aborted, which unsubscribes its
    /// feeds, cancels its timers, and drops its state.  Any handle still
    /// held for it starts failing with [`ChatError::Closed`].
    pub fn close(&mut self, conversation: ConversationId) -> bool {
        match self.open.remove(&conversation) {
            Some(session) => {
                session.task.abort();
                info!(conversation = %conversation, "Closed conversation view");
                true
            }
            None => false,
        }
    }

    /// Tear down every open view.
    pub fn shutdown(&mut self) {
        for (conversation, session) in self.open.drain() {
            session.task.abort();
            debug!(conversation = %conversation, "Closed conversation view");
        }
    }
}

impl Drop for ChatSessions {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

struct SessionScope {
    services: Services,
    user: UserId,
    conversation: Conversation,
    participants: Vec<UserId>,
    presence: PresenceTracker,
    list: MessageList,
    roster: TypingRoster,
    throttle: TypingBroadcaster,
    online: Vec<Profile>,
    profile_cache: HashMap<UserId, Profile>,
    snapshot_tx: watch::Sender<ChatSnapshot>,
    notif_tx: mpsc::Sender<SessionNotification>,
    done_tx: mpsc::Sender<SendOutcome>,
}

impl SessionScope {
    /// Build the scope, run the initial load, and spawn the event loop.
    ///
    /// The feeds are subscribed before the load so no insert falls into the
    /// gap; exact-id reconciliation absorbs the overlap.
    async fn spawn(
        services: Services,
        user: UserId,
        conversation: Conversation,
        participants: Vec<UserId>,
    ) -> Result<(ChatHandle, JoinHandle<()>)> {
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (notif_tx, notif_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(ChatSnapshot::default());
        let (done_tx, done_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let message_rx = services.realtime.message_feed(conversation.id);
        let typing_rx = services.realtime.typing_feed(conversation.id);
        let receipt_rx = services.realtime.receipt_feed(conversation.id);

        let presence = PresenceTracker::new(services.profiles.clone(), user);
        let mut scope = Self {
            services,
            user,
            conversation,
            participants,
            presence,
            list: MessageList::new(),
            roster: TypingRoster::new(),
            throttle: TypingBroadcaster::new(),
            online: Vec::new(),
            profile_cache: HashMap::new(),
            snapshot_tx,
            notif_tx,
            done_tx,
        };

        scope.cache_profiles(&[user]).await;
        scope.load().await?;

        let conversation_id = scope.conversation.id;
        let task = tokio::spawn(scope.run(cmd_rx, message_rx, typing_rx, receipt_rx, done_rx));

        Ok((
            ChatHandle {
                conversation: conversation_id,
                cmd_tx,
                snapshot_rx,
                notif_rx,
            },
            task,
        ))
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut message_rx: broadcast::Receiver<MessageRow>,
        mut typing_rx: broadcast::Receiver<TypingSignal>,
        mut receipt_rx: broadcast::Receiver<ReadReceipt>,
        mut done_rx: mpsc::Receiver<SendOutcome>,
    ) {
        let mut presence_poll = interval(PRESENCE_POLL_INTERVAL);
        presence_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(conversation = %self.conversation.id, "Session task started");

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            // Handle dropped: the view is gone
                            break;
                        }
                    }
                }

                event = message_rx.recv() => {
                    match event {
                        Ok(row) => self.handle_insert(row).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Message feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                event = typing_rx.recv() => {
                    match event {
                        Ok(signal) => self.handle_typing(signal),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Typing feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                event = receipt_rx.recv() => {
                    match event {
                        Ok(receipt) => self.handle_receipt(receipt),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Receipt feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                outcome = done_rx.recv() => {
                    if let Some(outcome) = outcome {
                        self.handle_send_outcome(outcome);
                    }
                }

                _ = presence_poll.tick() => self.poll_presence().await,

                _ = async {
                    match deadline {
                        Some(at) => sleep_until(at).await,
                        None => future::pending::<()>().await,
                    }
                } => self.handle_deadline().await,
            }
        }

        info!(conversation = %self.conversation.id, "Session task terminated");
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Send {
                content,
                media,
                reply,
            } => {
                let _ = reply.send(self.start_send(content, media));
            }
            SessionCommand::MarkRead { ids, reply } => {
                let _ = reply.send(self.mark_read(ids).await);
            }
            SessionCommand::InputChanged => self.on_input().await,
            SessionCommand::Reload { reply } => {
                let result = self.load().await;
                if let Err(e) = &result {
                    let _ = self.notif_tx.try_send(SessionNotification::LoadFailed {
                        reason: e.to_string(),
                    });
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Append the optimistic entry synchronously, then persist in a
    /// spawned task.  The success path relies on the feed echo to finalize
    /// the entry; finalizing here as well would race it.
    fn start_send(&mut self, content: String, media: Option<MediaRef>) -> Result<MessageId> {
        let id = MessageId::new();
        let entry = ChatEntry {
            id,
            conversation_id: self.conversation.id,
            sender: self.cached_profile(self.user),
            content: content.clone(),
            media: media.clone(),
            created_at: Utc::now(),
            read: ReadState::for_kind(self.conversation.kind),
            pending: true,
        };
        self.list.push_optimistic(entry);
        self.publish_snapshot();

        let message = NewMessage {
            id,
            conversation_id: self.conversation.id,
            sender_id: self.user,
            content,
            media,
        };
        let store = self.services.store.clone();
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let result = store.insert_message(message).await.map(|_| ());
            // Receiver gone means the view closed; the outcome is moot then
            let _ = done.send(SendOutcome { message_id: id, result }).await;
        });

        debug!(message = %id, conversation = %self.conversation.id, "Optimistic send started");
        Ok(id)
    }

    fn handle_send_outcome(&mut self, outcome: SendOutcome) {
        if let Err(e) = outcome.result {
            warn!(
                message = %outcome.message_id,
                error = %e,
                "Send failed, rolling back optimistic entry"
            );
            if self.list.remove(outcome.message_id) {
                self.publish_snapshot();
            }
            let _ = self.notif_tx.try_send(SessionNotification::SendFailed {
                message_id: outcome.message_id,
                reason: e.to_string(),
            });
        }
    }

    async fn mark_read(&mut self, ids: Vec<MessageId>) -> Result<()> {
        let ids: Vec<MessageId> = ids.into_iter().filter(|id| self.list.contains(*id)).collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.commit_read(ids).await;
        self.publish_snapshot();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Fetch the history and install it as the new baseline.  On failure
    /// the previous state stays untouched.
    async fn load(&mut self) -> Result<()> {
        let limit = match self.conversation.kind {
            ConversationKind::Room => Some(ROOM_HISTORY_LIMIT),
            ConversationKind::Direct => None,
        };

        let rows = self
            .services
            .store
            .messages(self.conversation.id, limit)
            .await
            .map_err(|e| {
                warn!(conversation = %self.conversation.id, error = %e, "History load failed");
                e
            })?;

        let senders: Vec<UserId> = rows.iter().map(|r| r.sender_id).collect();
        self.cache_profiles(&senders).await;

        let entries = rows
            .into_iter()
            .map(|row| {
                let sender = self.cached_profile(row.sender_id);
                ChatEntry::confirmed(row, sender)
            })
            .collect();
        self.list.replace_all(entries);

        // Opening the view reads it: everything from others becomes read
        let unread = self.list.unread_from_others(self.user);
        if !unread.is_empty() {
            self.commit_read(unread).await;
        }

        self.publish_snapshot();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Incoming events
    // ------------------------------------------------------------------

    async fn handle_insert(&mut self, row: MessageRow) {
        let sender_id = row.sender_id;
        self.cache_profiles(&[sender_id]).await;

        let id = row.id;
        let sender = self.cached_profile(sender_id);
        let entry = ChatEntry::confirmed(row, sender);

        match self.list.reconcile(entry) {
            Reconciliation::Duplicate => {
                debug!(message = %id, "Duplicate insert event ignored");
                return;
            }
            Reconciliation::Confirmed => {
                debug!(message = %id, "Optimistic entry confirmed");
            }
            Reconciliation::Appended => {}
        }

        if sender_id != self.user {
            // The view is open, so the message is read the moment it lands;
            // a typist who just delivered is no longer typing
            self.commit_read(vec![id]).await;
            self.roster.apply_stopped(sender_id);
        }

        self.publish_snapshot();
    }

    fn handle_typing(&mut self, signal: TypingSignal) {
        if signal.user_id == self.user {
            return;
        }
        if signal.active {
            self.roster.apply_active(signal.user_id, Instant::now());
        } else {
            self.roster.apply_stopped(signal.user_id);
        }
        self.publish_snapshot();
    }

    fn handle_receipt(&mut self, receipt: ReadReceipt) {
        if receipt.reader == self.user {
            return;
        }
        self.list.mark_read(&receipt.message_ids, receipt.reader);
        self.publish_snapshot();
    }

    // ------------------------------------------------------------------
    // Typing timers
    // ------------------------------------------------------------------

    async fn on_input(&mut self) {
        if self.throttle.on_input(Instant::now()) {
            self.broadcast_typing(true).await;
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.throttle.idle_deadline(), self.roster.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn handle_deadline(&mut self) {
        let now = Instant::now();
        if self.throttle.on_deadline(now) {
            // Explicit stop, not a reliance on the remote side's timeout
            self.broadcast_typing(false).await;
        }
        if self.roster.expire(now) {
            self.publish_snapshot();
        }
    }

    async fn broadcast_typing(&self, active: bool) {
        let signal = TypingSignal {
            conversation_id: self.conversation.id,
            user_id: self.user,
            active,
            sent_at: Utc::now(),
        };
        if let Err(e) = self.services.realtime.publish_typing(signal).await {
            warn!(error = %e, "Failed to broadcast typing signal");
        }
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    async fn poll_presence(&mut self) {
        let targets = self.presence_targets();
        if targets.is_empty() {
            if !self.online.is_empty() {
                self.online.clear();
                self.publish_snapshot();
            }
            return;
        }

        let fetched = match self.presence.online_among(&targets).await {
            Ok(profiles) => profiles,
            Err(e) => {
                // Keep showing the previous list rather than flickering
                debug!(error = %e, "Presence poll failed");
                return;
            }
        };

        let merged = refresh_online_list(&self.online, fetched);
        if merged != self.online {
            self.online = merged;
            self.publish_snapshot();
        }
    }

    fn presence_targets(&self) -> Vec<UserId> {
        match self.conversation.kind {
            ConversationKind::Direct => self
                .participants
                .iter()
                .copied()
                .filter(|u| *u != self.user)
                .collect(),
            ConversationKind::Room => {
                // No participant rows for the room: watch whoever is visible
                let mut targets: Vec<UserId> = Vec::new();
                for entry in self.list.entries() {
                    let sender = entry.sender.id;
                    if sender != self.user && !targets.contains(&sender) {
                        targets.push(sender);
                    }
                }
                for user in self.roster.users() {
                    if user != self.user && !targets.contains(&user) {
                        targets.push(user);
                    }
                }
                targets
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    /// Persist and broadcast that the local user has read `ids`, then flip
    /// the local entries.  Best-effort on the backend side: read-state
    /// self-heals on the next load.
    async fn commit_read(&mut self, ids: Vec<MessageId>) {
        if let Err(e) = self
            .services
            .store
            .mark_read(self.conversation.id, &ids, self.user)
            .await
        {
            warn!(error = %e, "Failed to persist read-state");
        }

        let receipt = ReadReceipt {
            conversation_id: self.conversation.id,
            message_ids: ids.clone(),
            reader: self.user,
        };
        if let Err(e) = self.services.realtime.publish_receipt(receipt).await {
            warn!(error = %e, "Failed to broadcast read receipt");
        }

        self.list.mark_read(&ids, self.user);
    }

    /// Fetch any of `users` missing from the cache.  Unresolvable profiles
    /// are left to the placeholder path.
    async fn cache_profiles(&mut self, users: &[UserId]) {
        let missing: Vec<UserId> = users
            .iter()
            .copied()
            .filter(|u| !self.profile_cache.contains_key(u))
            .collect();
        if missing.is_empty() {
            return;
        }
        match self.services.profiles.profiles(&missing).await {
            Ok(profiles) => {
                for profile in profiles {
                    self.profile_cache.insert(profile.id, profile);
                }
            }
            Err(e) => debug!(error = %e, "Profile batch fetch failed"),
        }
    }

    fn cached_profile(&self, user: UserId) -> Profile {
        self.profile_cache
            .get(&user)
            .cloned()
            .unwrap_or_else(|| Profile::placeholder(user))
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(ChatSnapshot {
            messages: self.list.to_vec(),
            typing_users: self.roster.users(),
            online_users: self.online.clone(),
        });
    }
}
