//! Domain model structs exchanged with the hosted backend.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MediaRef, MessageId, UserId};

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// Read-only profile snapshot, owned by the external identity service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: UserId,
    pub username: String,
    /// Reference to the avatar image in the media store.
    pub avatar_url: Option<String>,
    /// Heartbeat timestamp; freshness drives the online derivation.
    pub last_active: DateTime<Utc>,
}

impl Profile {
    /// Stand-in for a sender whose profile could not be resolved
    /// (deleted account, lagging cache).
    pub fn placeholder(id: UserId) -> Self {
        Self {
            id,
            username: format!("user-{}", id.short()),
            avatar_url: None,
            last_active: DateTime::<Utc>::MIN_UTC,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// Exactly two participants, enforced at creation.
    Direct,
    /// Fixed well-known identity, unbounded participants.
    Room,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub created_at: DateTime<Utc>,
    /// Bumped by the store whenever a message lands; drives list ordering.
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Read-state
// ---------------------------------------------------------------------------

/// Who has read a message.  Direct conversations track a single flag, rooms
/// track the set of readers.  State only ever grows; there is no un-read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ReadState {
    Direct { read: bool },
    Room { read_by: BTreeSet<UserId> },
}

impl ReadState {
    /// Fresh (unread) state for a message in a conversation of `kind`.
    pub fn for_kind(kind: ConversationKind) -> Self {
        match kind {
            ConversationKind::Direct => Self::Direct { read: false },
            ConversationKind::Room => Self::Room {
                read_by: BTreeSet::new(),
            },
        }
    }

    /// Record that `reader` has seen the message.
    pub fn mark(&mut self, reader: UserId) {
        match self {
            Self::Direct { read } => *read = true,
            Self::Room { read_by } => {
                read_by.insert(reader);
            }
        }
    }

    pub fn is_read_by(&self, user: UserId) -> bool {
        match self {
            Self::Direct { read } => *read,
            Self::Room { read_by } => read_by.contains(&user),
        }
    }

    pub fn is_read(&self) -> bool {
        match self {
            Self::Direct { read } => *read,
            Self::Room { read_by } => !read_by.is_empty(),
        }
    }

    /// Fold another observation of the same message's read-state into this
    /// one.  Union semantics, so the result never loses a recorded reader.
    pub fn absorb(&mut self, other: &ReadState) {
        match (self, other) {
            (Self::Direct { read }, Self::Direct { read: other_read }) => {
                *read = *read || *other_read;
            }
            (Self::Room { read_by }, Self::Room { read_by: other_read_by }) => {
                read_by.extend(other_read_by.iter().copied());
            }
            // Mismatched kinds cannot refer to the same message
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Input to `insert_message`.  The id is the client-generated correlation
/// token; the store persists it unchanged and echoes it on the row feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub media: Option<MediaRef>,
}

/// A persisted message row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub media: Option<MediaRef>,
    /// Assigned by the store at insert time.
    pub created_at: DateTime<Utc>,
    pub read: ReadState,
}
