//! Conversation creation, lookup, and deletion.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use palaver_shared::models::{Conversation, ConversationKind, MessageRow, Profile};
use palaver_shared::types::{ConversationId, UserId};
use palaver_shared::{ChatError, Result};

use crate::Services;

/// A conversation annotated for list rendering.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPreview {
    pub conversation: Conversation,
    pub participants: Vec<Profile>,
    pub latest_message: Option<MessageRow>,
}

impl ConversationPreview {
    fn last_activity(&self) -> DateTime<Utc> {
        self.latest_message
            .as_ref()
            .map(|m| m.created_at)
            .unwrap_or(self.conversation.updated_at)
    }
}

/// Creation, lookup, and cascade deletion of conversations, bound to one
/// authenticated user.
pub struct ConversationDirectory {
    services: Services,
    user: UserId,
    create_lock: Mutex<()>,
}

impl ConversationDirectory {
    pub fn new(services: Services, user: UserId) -> Self {
        Self {
            services,
            user,
            create_lock: Mutex::new(()),
        }
    }

    /// Find the direct conversation between `a` and `b`, creating it (plus
    /// both participant rows) when absent.  Either argument order returns
    /// the same conversation.
    pub async fn find_or_create_direct(&self, a: UserId, b: UserId) -> Result<Conversation> {
        if a == b {
            return Err(ChatError::InvalidArgument(
                "a direct conversation needs two distinct participants".into(),
            ));
        }
        if self.user != a && self.user != b {
            return Err(ChatError::PermissionDenied);
        }

        // Single writer per client session: the scan-then-create window
        // must not interleave with itself
        let _guard = self.create_lock.lock().await;

        if let Some(existing) = self.find_direct(a, b).await? {
            return Ok(existing);
        }

        let conversation = self
            .services
            .store
            .create_conversation(ConversationKind::Direct)
            .await?;
        self.services.store.add_participant(conversation.id, a).await?;
        self.services.store.add_participant(conversation.id, b).await?;

        info!(conversation = %conversation.id, "Created direct conversation");
        Ok(conversation)
    }

    async fn find_direct(&self, a: UserId, b: UserId) -> Result<Option<Conversation>> {
        for conversation in self.services.store.conversations_for_user(a).await? {
            if conversation.kind != ConversationKind::Direct {
                continue;
            }
            let participants = self.services.store.participants(conversation.id).await?;
            if participants.contains(&b) {
                return Ok(Some(conversation));
            }
        }
        Ok(None)
    }

    /// Conversations of `user`, each with its participants' profile
    /// snapshots and latest message, most recently active first.
    pub async fn list_conversations(&self, user: UserId) -> Result<Vec<ConversationPreview>> {
        let mut previews = Vec::new();
        for conversation in self.services.store.conversations_for_user(user).await? {
            let ids = self.services.store.participants(conversation.id).await?;
            let participants = self.services.profiles.profiles(&ids).await?;
            let latest_message = self.services.store.latest_message(conversation.id).await?;
            previews.push(ConversationPreview {
                conversation,
                participants,
                latest_message,
            });
        }
        previews.sort_by(|x, y| y.last_activity().cmp(&x.last_activity()));
        Ok(previews)
    }

    /// Delete messages, then participants, then the conversation row.  A
    /// failure aborts the cascade; rows already deleted stay deleted.
    pub async fn delete_conversation(&self, id: ConversationId) -> Result<()> {
        let conversation = self.services.store.conversation(id).await?;
        if conversation.kind == ConversationKind::Room {
            return Err(ChatError::PermissionDenied);
        }
        if !self
            .services
            .store
            .participants(id)
            .await?
            .contains(&self.user)
        {
            return Err(ChatError::PermissionDenied);
        }

        self.services
            .store
            .delete_messages(id)
            .await
            .map_err(|e| ChatError::PartialCascade {
                stage: "messages",
                reason: e.to_string(),
            })?;
        self.services
            .store
            .delete_participants(id)
            .await
            .map_err(|e| ChatError::PartialCascade {
                stage: "participants",
                reason: e.to_string(),
            })?;
        self.services
            .store
            .delete_conversation(id)
            .await
            .map_err(|e| ChatError::PartialCascade {
                stage: "conversation",
                reason: e.to_string(),
            })?;

        info!(conversation = %id, "Deleted conversation");
        Ok(())
    }
}
