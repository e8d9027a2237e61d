//! In-memory backend used by tests and local development.
//!
//! Behaves like the hosted stack it stands in for: `insert_message` echoes
//! the stored row onto the conversation's message feed the way a row-change
//! subscription would, and the ephemeral topics are plain broadcast channels
//! with no replay.  All handles created through [`MemoryBackend::session`]
//! share one set of tables, so several clients can run against one backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use palaver_shared::constants::CHANNEL_CAPACITY;
use palaver_shared::models::{Conversation, ConversationKind, MessageRow, NewMessage, Profile, ReadState};
use palaver_shared::protocol::{ReadReceipt, TypingSignal};
use palaver_shared::types::{ConversationId, MessageId, UserId};
use palaver_shared::{ChatError, Result};

use crate::{ConversationStore, ProfileService, Realtime};

#[derive(Default)]
struct Tables {
    conversations: HashMap<ConversationId, Conversation>,
    participants: Vec<(ConversationId, UserId)>,
    messages: HashMap<ConversationId, Vec<MessageRow>>,
    profiles: HashMap<UserId, Profile>,
}

#[derive(Default)]
struct Topics {
    messages: Mutex<HashMap<ConversationId, broadcast::Sender<MessageRow>>>,
    typing: Mutex<HashMap<ConversationId, broadcast::Sender<TypingSignal>>>,
    receipts: Mutex<HashMap<ConversationId, broadcast::Sender<ReadReceipt>>>,
}

fn topic<T: Clone>(
    map: &Mutex<HashMap<ConversationId, broadcast::Sender<T>>>,
    conversation: ConversationId,
) -> broadcast::Sender<T> {
    let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
    map.entry(conversation)
        .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
        .clone()
}

#[derive(Clone)]
pub struct MemoryBackend {
    tables: Arc<Mutex<Tables>>,
    topics: Arc<Topics>,
    current: Option<UserId>,
}

impl MemoryBackend {
    /// Fresh backend with the community room already provisioned.
    pub fn new() -> Self {
        let mut tables = Tables::default();
        let now = Utc::now();
        let room = Conversation {
            id: ConversationId::community(),
            kind: ConversationKind::Room,
            created_at: now,
            updated_at: now,
        };
        tables.conversations.insert(room.id, room);

        Self {
            tables: Arc::new(Mutex::new(tables)),
            topics: Arc::new(Topics::default()),
            current: None,
        }
    }

    /// Handle bound to an authenticated user, sharing the same tables and
    /// topics as `self`.
    pub fn session(&self, user: UserId) -> Self {
        Self {
            tables: self.tables.clone(),
            topics: self.topics.clone(),
            current: Some(user),
        }
    }

    /// Register (or overwrite) a profile snapshot.
    pub fn upsert_profile(&self, profile: Profile) {
        if let Ok(mut tables) = self.lock() {
            tables.profiles.insert(profile.id, profile);
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| ChatError::Transient("backend state poisoned".into()))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProfileService for MemoryBackend {
    async fn current_user(&self) -> Result<UserId> {
        self.current.ok_or(ChatError::Unauthenticated)
    }

    async fn profile(&self, user: UserId) -> Result<Profile> {
        self.lock()?
            .profiles
            .get(&user)
            .cloned()
            .ok_or(ChatError::NotFound)
    }

    async fn profiles(&self, users: &[UserId]) -> Result<Vec<Profile>> {
        let tables = self.lock()?;
        Ok(users
            .iter()
            .filter_map(|id| tables.profiles.get(id).cloned())
            .collect())
    }

    async fn touch_last_active(&self, user: UserId) -> Result<()> {
        let mut tables = self.lock()?;
        let profile = tables.profiles.get_mut(&user).ok_or(ChatError::NotFound)?;
        profile.last_active = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemoryBackend {
    async fn create_conversation(&self, kind: ConversationKind) -> Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::new(),
            kind,
            created_at: now,
            updated_at: now,
        };
        self.lock()?
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn add_participant(&self, conversation: ConversationId, user: UserId) -> Result<()> {
        let mut tables = self.lock()?;
        if !tables.conversations.contains_key(&conversation) {
            return Err(ChatError::NotFound);
        }
        if !tables.participants.contains(&(conversation, user)) {
            tables.participants.push((conversation, user));
        }
        Ok(())
    }

    async fn conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.lock()?
            .conversations
            .get(&id)
            .cloned()
            .ok_or(ChatError::NotFound)
    }

    async fn conversations_for_user(&self, user: UserId) -> Result<Vec<Conversation>> {
        let tables = self.lock()?;
        let mut conversations = Vec::new();
        for (conversation_id, participant) in &tables.participants {
            if *participant == user {
                if let Some(conversation) = tables.conversations.get(conversation_id) {
                    conversations.push(conversation.clone());
                }
            }
        }
        Ok(conversations)
    }

    async fn participants(&self, conversation: ConversationId) -> Result<Vec<UserId>> {
        let tables = self.lock()?;
        if !tables.conversations.contains_key(&conversation) {
            return Err(ChatError::NotFound);
        }
        Ok(tables
            .participants
            .iter()
            .filter(|(c, _)| *c == conversation)
            .map(|(_, u)| *u)
            .collect())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<MessageRow> {
        let row = {
            let mut tables = self.lock()?;
            let kind = tables
                .conversations
                .get(&message.conversation_id)
                .map(|c| c.kind)
                .ok_or(ChatError::NotFound)?;

            let rows = tables.messages.entry(message.conversation_id).or_default();
            if let Some(existing) = rows.iter().find(|r| r.id == message.id) {
                // At-least-once insert: same correlation token, same row
                return Ok(existing.clone());
            }

            let row = MessageRow {
                id: message.id,
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                content: message.content,
                media: message.media,
                created_at: Utc::now(),
                read: ReadState::for_kind(kind),
            };
            rows.push(row.clone());

            if let Some(conversation) = tables.conversations.get_mut(&message.conversation_id) {
                conversation.updated_at = row.created_at;
            }
            row
        };

        // Echo the stored row to subscribers, like a row-change feed would
        debug!(message = %row.id, conversation = %row.conversation_id, "Stored message row");
        let _ = topic(&self.topics.messages, row.conversation_id).send(row.clone());
        Ok(row)
    }

    async fn messages(
        &self,
        conversation: ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRow>> {
        let tables = self.lock()?;
        if !tables.conversations.contains_key(&conversation) {
            return Err(ChatError::NotFound);
        }
        let rows = tables.messages.get(&conversation).map(Vec::as_slice).unwrap_or(&[]);
        let start = limit.map_or(0, |l| rows.len().saturating_sub(l));
        Ok(rows[start..].to_vec())
    }

    async fn latest_message(&self, conversation: ConversationId) -> Result<Option<MessageRow>> {
        let tables = self.lock()?;
        if !tables.conversations.contains_key(&conversation) {
            return Err(ChatError::NotFound);
        }
        Ok(tables
            .messages
            .get(&conversation)
            .and_then(|rows| rows.last().cloned()))
    }

    async fn mark_read(
        &self,
        conversation: ConversationId,
        ids: &[MessageId],
        reader: UserId,
    ) -> Result<()> {
        let mut tables = self.lock()?;
        if let Some(rows) = tables.messages.get_mut(&conversation) {
            for row in rows.iter_mut() {
                if ids.contains(&row.id) {
                    row.read.mark(reader);
                }
            }
        }
        Ok(())
    }

    async fn delete_messages(&self, conversation: ConversationId) -> Result<()> {
        self.lock()?.messages.remove(&conversation);
        Ok(())
    }

    async fn delete_participants(&self, conversation: ConversationId) -> Result<()> {
        self.lock()?.participants.retain(|(c, _)| *c != conversation);
        Ok(())
    }

    async fn delete_conversation(&self, conversation: ConversationId) -> Result<()> {
        self.lock()?
            .conversations
            .remove(&conversation)
            .map(|_| ())
            .ok_or(ChatError::NotFound)
    }
}

#[async_trait]
impl Realtime for MemoryBackend {
    fn message_feed(&self, conversation: ConversationId) -> broadcast::Receiver<MessageRow> {
        topic(&self.topics.messages, conversation).subscribe()
    }

    fn typing_feed(&self, conversation: ConversationId) -> broadcast::Receiver<TypingSignal> {
        topic(&self.topics.typing, conversation).subscribe()
    }

    fn receipt_feed(&self, conversation: ConversationId) -> broadcast::Receiver<ReadReceipt> {
        topic(&self.topics.receipts, conversation).subscribe()
    }

    async fn publish_typing(&self, signal: TypingSignal) -> Result<()> {
        let _ = topic(&self.topics.typing, signal.conversation_id).send(signal);
        Ok(())
    }

    async fn publish_receipt(&self, receipt: ReadReceipt) -> Result<()> {
        let _ = topic(&self.topics.receipts, receipt.conversation_id).send(receipt);
        Ok(())
    }
}
