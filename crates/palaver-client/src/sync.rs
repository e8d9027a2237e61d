//! Ordered message state for one conversation view.
//!
//! Every mutation of the visible sequence funnels through [`MessageList`],
//! so the two hard invariants live in one place: the list is always sorted
//! by `created_at` ascending, and an optimistic entry and its store echo are
//! one logical message, matched by their shared correlation id.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use palaver_shared::models::{MessageRow, Profile, ReadState};
use palaver_shared::types::{ConversationId, MediaRef, MessageId, UserId};

/// One visible entry of the message sequence.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: Profile,
    pub content: String,
    pub media: Option<MediaRef>,
    pub created_at: DateTime<Utc>,
    pub read: ReadState,
    /// Locally appended, not yet confirmed by the store.
    pub pending: bool,
}

impl ChatEntry {
    /// Build a confirmed entry from a stored row and its sender profile.
    pub fn confirmed(row: MessageRow, sender: Profile) -> Self {
        Self {
            id: row.id,
            conversation_id: row.conversation_id,
            sender,
            content: row.content,
            media: row.media,
            created_at: row.created_at,
            read: row.read,
            pending: false,
        }
    }
}

/// Outcome of reconciling an incoming row against the local sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Same id already confirmed: at-least-once re-delivery, ignored.
    Duplicate,
    /// Replaced the matching optimistic entry in place.
    Confirmed,
    /// New message, inserted in timestamp order.
    Appended,
}

#[derive(Debug, Default)]
pub struct MessageList {
    entries: Vec<ChatEntry>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn to_vec(&self) -> Vec<ChatEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Install a freshly loaded baseline.  Pending optimistic entries the
    /// baseline does not know about are carried over, so a reload cannot
    /// silently drop an in-flight send.
    pub fn replace_all(&mut self, mut entries: Vec<ChatEntry>) {
        for entry in self.entries.iter() {
            if entry.pending && !entries.iter().any(|n| n.id == entry.id) {
                entries.push(entry.clone());
            }
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.entries = entries;
    }

    /// Append a locally sent entry ahead of its persistence round trip.
    pub fn push_optimistic(&mut self, entry: ChatEntry) {
        debug_assert!(entry.pending);
        self.insert_sorted(entry);
    }

    /// Drop the entry with the given id (failed-send rollback).
    pub fn remove(&mut self, id: MessageId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        before != self.entries.len()
    }

    /// Fold an incoming row-change event into the sequence.
    pub fn reconcile(&mut self, entry: ChatEntry) -> Reconciliation {
        if let Some(pos) = self.entries.iter().position(|e| e.id == entry.id) {
            if !self.entries[pos].pending {
                return Reconciliation::Duplicate;
            }
            // Keep the slot so the view does not jump, but take the stored
            // row's fields; a receipt that raced the echo must survive.
            let mut confirmed = entry;
            confirmed.read.absorb(&self.entries[pos].read);
            self.entries[pos] = confirmed;
            return Reconciliation::Confirmed;
        }
        self.insert_sorted(entry);
        Reconciliation::Appended
    }

    /// Record `reader` on every matching entry.  Monotonic, never reorders.
    pub fn mark_read(&mut self, ids: &[MessageId], reader: UserId) {
        for entry in self.entries.iter_mut() {
            if ids.contains(&entry.id) {
                entry.read.mark(reader);
            }
        }
    }

    /// Ids of confirmed messages from other senders that `me` has not read.
    pub fn unread_from_others(&self, me: UserId) -> Vec<MessageId> {
        self.entries
            .iter()
            .filter(|e| !e.pending && e.sender.id != me && !e.read.is_read_by(me))
            .map(|e| e.id)
            .collect()
    }

    fn insert_sorted(&mut self, entry: ChatEntry) {
        // After the last entry with created_at <= the new one, so equal
        // timestamps keep arrival order
        let pos = self
            .entries
            .partition_point(|e| e.created_at <= entry.created_at);
        if pos < self.entries.len() {
            debug!(message = %entry.id, position = pos, "Out-of-order insert event");
        }
        self.entries.insert(pos, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use palaver_shared::models::ConversationKind;

    fn profile(name: &str) -> Profile {
        Profile {
            id: UserId::new(),
            username: name.to_string(),
            avatar_url: None,
            last_active: Utc::now(),
        }
    }

    fn entry(sender: &Profile, content: &str, at: DateTime<Utc>, pending: bool) -> ChatEntry {
        ChatEntry {
            id: MessageId::new(),
            conversation_id: ConversationId::new(),
            sender: sender.clone(),
            content: content.to_string(),
            media: None,
            created_at: at,
            read: ReadState::for_kind(ConversationKind::Direct),
            pending,
        }
    }

    #[test]
    fn echo_confirms_optimistic_entry_in_place() {
        let alice = profile("alice");
        let now = Utc::now();
        let mut list = MessageList::new();

        list.replace_all(vec![
            entry(&alice, "first", now - Duration::seconds(20), false),
            entry(&alice, "second", now - Duration::seconds(10), false),
        ]);

        let optimistic = entry(&alice, "third", now, true);
        let id = optimistic.id;
        list.push_optimistic(optimistic);
        assert_eq!(list.len(), 3);

        let mut echo = entry(&alice, "third", now + Duration::seconds(1), false);
        echo.id = id;
        assert_eq!(list.reconcile(echo.clone()), Reconciliation::Confirmed);
        assert_eq!(list.len(), 3);
        assert_eq!(list.entries()[2].id, id);
        assert!(!list.entries()[2].pending);

        // Re-delivery of the same row is a no-op
        assert_eq!(list.reconcile(echo), Reconciliation::Duplicate);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn foreign_messages_insert_in_timestamp_order() {
        let alice = profile("alice");
        let now = Utc::now();
        let mut list = MessageList::new();

        list.replace_all(vec![entry(&alice, "late", now, false)]);

        let earlier = entry(&alice, "early", now - Duration::seconds(5), false);
        assert_eq!(list.reconcile(earlier), Reconciliation::Appended);
        assert_eq!(list.entries()[0].content, "early");
        assert_eq!(list.entries()[1].content, "late");
        assert!(list
            .entries()
            .windows(2)
            .all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn failed_send_rolls_back_exactly_one_entry() {
        let alice = profile("alice");
        let now = Utc::now();
        let mut list = MessageList::new();
        list.replace_all(vec![entry(&alice, "kept", now - Duration::seconds(1), false)]);

        let optimistic = entry(&alice, "doomed", now, true);
        let id = optimistic.id;
        list.push_optimistic(optimistic);
        assert_eq!(list.len(), 2);

        assert!(list.remove(id));
        assert_eq!(list.len(), 1);
        assert_eq!(list.entries()[0].content, "kept");
        assert!(!list.remove(id));
    }

    #[test]
    fn reload_carries_in_flight_optimistic_entries() {
        let alice = profile("alice");
        let now = Utc::now();
        let mut list = MessageList::new();

        let optimistic = entry(&alice, "in flight", now, true);
        let id = optimistic.id;
        list.push_optimistic(optimistic);

        list.replace_all(vec![entry(&alice, "fetched", now - Duration::seconds(3), false)]);
        assert_eq!(list.len(), 2);
        assert!(list.contains(id));
        assert!(list.entries()[1].pending);
    }

    #[test]
    fn receipt_that_raced_the_echo_survives_confirmation() {
        let alice = profile("alice");
        let bob = profile("bob");
        let now = Utc::now();
        let mut list = MessageList::new();

        let optimistic = entry(&alice, "hi", now, true);
        let id = optimistic.id;
        list.push_optimistic(optimistic);
        list.mark_read(&[id], bob.id);

        let mut echo = entry(&alice, "hi", now, false);
        echo.id = id;
        list.reconcile(echo);
        assert!(list.entries()[0].read.is_read());
    }

    #[test]
    fn unread_from_others_skips_own_and_pending() {
        let alice = profile("alice");
        let bob = profile("bob");
        let now = Utc::now();
        let mut list = MessageList::new();

        list.replace_all(vec![
            entry(&bob, "theirs", now - Duration::seconds(2), false),
            entry(&alice, "mine", now - Duration::seconds(1), false),
        ]);
        list.push_optimistic(entry(&bob, "pending", now, true));

        let unread = list.unread_from_others(alice.id);
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0], list.entries()[0].id);

        list.mark_read(&unread, alice.id);
        assert!(list.unread_from_others(alice.id).is_empty());
    }
}
