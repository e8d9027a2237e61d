use async_trait::async_trait;

use palaver_shared::models::{Conversation, ConversationKind, MessageRow, NewMessage};
use palaver_shared::types::{ConversationId, MessageId, UserId};
use palaver_shared::Result;

/// Row-level access to the managed relational store.
///
/// The store owns persistence entirely; this core never sees a connection,
/// a transaction, or a schema.  Every mutation is a single row-level call,
/// and ordering across calls is the caller's business.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, kind: ConversationKind) -> Result<Conversation>;

    /// Link a user to a conversation.  Inserting the same pair twice is a
    /// no-op, never a duplicate row.
    async fn add_participant(&self, conversation: ConversationId, user: UserId) -> Result<()>;

    async fn conversation(&self, id: ConversationId) -> Result<Conversation>;

    /// Conversations the user participates in.  The community room tracks
    /// no participant rows and is not included.
    async fn conversations_for_user(&self, user: UserId) -> Result<Vec<Conversation>>;

    async fn participants(&self, conversation: ConversationId) -> Result<Vec<UserId>>;

    /// Insert-returning-row.  Persists the client-generated id unchanged,
    /// assigns `created_at`, and echoes the stored row on the conversation's
    /// message feed.  Re-inserting an existing id returns the stored row
    /// without a second echo.
    async fn insert_message(&self, message: NewMessage) -> Result<MessageRow>;

    /// The most recent `limit` messages (all of them when `None`), returned
    /// in ascending `created_at` order.
    async fn messages(
        &self,
        conversation: ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRow>>;

    async fn latest_message(&self, conversation: ConversationId) -> Result<Option<MessageRow>>;

    /// Monotonic read-state update for a batch of messages.  Ids that do
    /// not resolve are skipped.
    async fn mark_read(
        &self,
        conversation: ConversationId,
        ids: &[MessageId],
        reader: UserId,
    ) -> Result<()>;

    async fn delete_messages(&self, conversation: ConversationId) -> Result<()>;

    async fn delete_participants(&self, conversation: ConversationId) -> Result<()>;

    async fn delete_conversation(&self, conversation: ConversationId) -> Result<()>;
}
