use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MessageId, UserId};

/// Ephemeral typing-indicator broadcast.
///
/// Never persisted: receivers keep it in memory and expire it after
/// `TYPING_SIGNAL_TTL` unless an explicit stop arrives first.  One topic per
/// conversation, so a scope only ever sees its own room's signals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    /// `true` while the user keeps typing, `false` for the explicit stop.
    pub active: bool,
    pub sent_at: DateTime<Utc>,
}

/// One or more messages read by `reader`.  Batched so that opening a
/// conversation with many unread messages produces a single event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<MessageId>,
    pub reader: UserId,
}
