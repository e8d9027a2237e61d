//! End-to-end scenarios: several clients sharing one in-memory backend,
//! exercising sends, reconciliation, receipts, typing, presence, and the
//! conversation lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::timeout;

use palaver_backend::{ConversationStore, MemoryBackend, Realtime};
use palaver_client::{ChatClient, ChatSnapshot, Services, SessionNotification};
use palaver_shared::models::{Conversation, ConversationKind, MessageRow, NewMessage, Profile};
use palaver_shared::types::{ConversationId, MessageId, UserId};
use palaver_shared::{ChatError, Result};

fn profile(name: &str) -> Profile {
    Profile {
        id: UserId::new(),
        username: name.to_string(),
        avatar_url: None,
        last_active: Utc::now(),
    }
}

struct Fixture {
    backend: MemoryBackend,
    alice: Profile,
    bob: Profile,
}

fn fixture() -> Fixture {
    palaver_client::init_tracing();
    let backend = MemoryBackend::new();
    let alice = profile("alice");
    let bob = profile("bob");
    backend.upsert_profile(alice.clone());
    backend.upsert_profile(bob.clone());
    Fixture { backend, alice, bob }
}

async fn connect(backend: &MemoryBackend, user: UserId) -> ChatClient {
    ChatClient::connect(Services::from_backend(backend.session(user)))
        .await
        .expect("connect")
}

async fn wait_for<F>(rx: &mut watch::Receiver<ChatSnapshot>, cond: F) -> ChatSnapshot
where
    F: Fn(&ChatSnapshot) -> bool,
{
    timeout(Duration::from_secs(60), async {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if cond(&snapshot) {
                    return snapshot.clone();
                }
            }
            rx.changed().await.expect("session ended");
        }
    })
    .await
    .expect("condition not met in time")
}

#[tokio::test]
async fn direct_round_trip_shows_exactly_one_message() {
    let f = fixture();
    let mut alice = connect(&f.backend, f.alice.id).await;
    let mut bob = connect(&f.backend, f.bob.id).await;

    let conversation = alice.find_or_create_direct(f.bob.id).await.unwrap();
    let a = alice.open(conversation.id).await.unwrap();
    let b = bob.open(conversation.id).await.unwrap();
    let mut a_watch = a.watch();
    let mut b_watch = b.watch();

    a.send("hi", None).await.unwrap();

    let b_snap = wait_for(&mut b_watch, |s| !s.messages.is_empty()).await;
    assert_eq!(b_snap.messages.len(), 1);
    assert_eq!(b_snap.messages[0].content, "hi");
    assert_eq!(b_snap.messages[0].sender.id, f.alice.id);
    assert!(!b_snap.messages[0].pending);

    // The echo confirms alice's optimistic entry instead of duplicating it
    let a_snap = wait_for(&mut a_watch, |s| {
        s.messages.len() == 1 && s.messages.iter().all(|m| !m.pending)
    })
    .await;
    assert_eq!(a_snap.messages[0].content, "hi");
}

#[tokio::test]
async fn read_receipt_reaches_the_sender() {
    let f = fixture();
    let mut alice = connect(&f.backend, f.alice.id).await;
    let mut bob = connect(&f.backend, f.bob.id).await;

    let conversation = alice.find_or_create_direct(f.bob.id).await.unwrap();
    let a = alice.open(conversation.id).await.unwrap();
    let mut a_watch = a.watch();

    a.send("unread?", None).await.unwrap();
    wait_for(&mut a_watch, |s| s.messages.iter().all(|m| !m.pending)).await;

    // Opening the conversation marks the message read and broadcasts the
    // receipt back to alice's open view
    let _b = bob.open(conversation.id).await.unwrap();
    let a_snap = wait_for(&mut a_watch, |s| {
        s.messages.first().is_some_and(|m| m.read.is_read())
    })
    .await;
    assert!(a_snap.messages[0].read.is_read_by(f.bob.id));
}

#[tokio::test]
async fn room_receipts_accumulate_readers() {
    let f = fixture();
    let carol = profile("carol");
    f.backend.upsert_profile(carol.clone());

    let mut alice = connect(&f.backend, f.alice.id).await;
    let mut bob = connect(&f.backend, f.bob.id).await;
    let mut carol_client = connect(&f.backend, carol.id).await;

    let room = ConversationId::community();
    let a = alice.open(room).await.unwrap();
    let mut a_watch = a.watch();

    a.send("hello room", None).await.unwrap();
    wait_for(&mut a_watch, |s| s.messages.iter().all(|m| !m.pending)).await;

    let _b = bob.open(room).await.unwrap();
    let _c = carol_client.open(room).await.unwrap();

    let a_snap = wait_for(&mut a_watch, |s| {
        s.messages
            .first()
            .is_some_and(|m| m.read.is_read_by(f.bob.id) && m.read.is_read_by(carol.id))
    })
    .await;
    assert!(!a_snap.messages[0].pending);
}

// Store decorator that fails inserts on demand; everything else delegates.
#[derive(Clone)]
struct FailingStore {
    inner: MemoryBackend,
    fail_inserts: Arc<AtomicBool>,
}

#[async_trait]
impl ConversationStore for FailingStore {
    async fn create_conversation(&self, kind: ConversationKind) -> Result<Conversation> {
        self.inner.create_conversation(kind).await
    }
    async fn add_participant(&self, conversation: ConversationId, user: UserId) -> Result<()> {
        self.inner.add_participant(conversation, user).await
    }
    async fn conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.inner.conversation(id).await
    }
    async fn conversations_for_user(&self, user: UserId) -> Result<Vec<Conversation>> {
        self.inner.conversations_for_user(user).await
    }
    async fn participants(&self, conversation: ConversationId) -> Result<Vec<UserId>> {
        self.inner.participants(conversation).await
    }
    async fn insert_message(&self, message: NewMessage) -> Result<MessageRow> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(ChatError::Transient("injected insert failure".into()));
        }
        self.inner.insert_message(message).await
    }
    async fn messages(
        &self,
        conversation: ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRow>> {
        self.inner.messages(conversation, limit).await
    }
    async fn latest_message(&self, conversation: ConversationId) -> Result<Option<MessageRow>> {
        self.inner.latest_message(conversation).await
    }
    async fn mark_read(
        &self,
        conversation: ConversationId,
        ids: &[MessageId],
        reader: UserId,
    ) -> Result<()> {
        self.inner.mark_read(conversation, ids, reader).await
    }
    async fn delete_messages(&self, conversation: ConversationId) -> Result<()> {
        self.inner.delete_messages(conversation).await
    }
    async fn delete_participants(&self, conversation: ConversationId) -> Result<()> {
        self.inner.delete_participants(conversation).await
    }
    async fn delete_conversation(&self, conversation: ConversationId) -> Result<()> {
        self.inner.delete_conversation(conversation).await
    }
}

#[tokio::test]
async fn failed_send_rolls_back_and_notifies() {
    let f = fixture();
    let session = f.backend.session(f.alice.id);
    let fail_inserts = Arc::new(AtomicBool::new(false));
    let services = Services {
        store: Arc::new(FailingStore {
            inner: session.clone(),
            fail_inserts: fail_inserts.clone(),
        }),
        profiles: Arc::new(session.clone()),
        realtime: Arc::new(session),
    };
    let mut alice = ChatClient::connect(services).await.unwrap();

    let conversation = alice.find_or_create_direct(f.bob.id).await.unwrap();
    let mut a = alice.open(conversation.id).await.unwrap();
    let mut a_watch = a.watch();

    fail_inserts.store(true, Ordering::SeqCst);
    let message_id = a.send("doomed", None).await.unwrap();

    // Optimistic first, then rolled back to the pre-send length
    let notification = timeout(Duration::from_secs(5), a.next_notification())
        .await
        .expect("notification in time")
        .expect("session alive");
    match notification {
        SessionNotification::SendFailed { message_id: failed, .. } => {
            assert_eq!(failed, message_id);
        }
        other => panic!("unexpected notification: {other:?}"),
    }
    let a_snap = wait_for(&mut a_watch, |s| s.messages.is_empty()).await;
    assert!(a_snap.messages.is_empty());

    // The channel recovers once the backend does
    fail_inserts.store(false, Ordering::SeqCst);
    a.send("second try", None).await.unwrap();
    let a_snap = wait_for(&mut a_watch, |s| {
        s.messages.len() == 1 && !s.messages[0].pending
    })
    .await;
    assert_eq!(a_snap.messages[0].content, "second try");
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_expires_and_broadcasts_stop() {
    let f = fixture();
    let mut alice = connect(&f.backend, f.alice.id).await;
    let mut bob = connect(&f.backend, f.bob.id).await;

    let conversation = alice.find_or_create_direct(f.bob.id).await.unwrap();
    let mut signals = f.backend.typing_feed(conversation.id);

    let a = alice.open(conversation.id).await.unwrap();
    let b = bob.open(conversation.id).await.unwrap();
    let mut b_watch = b.watch();

    a.input_changed().await.unwrap();
    a.input_changed().await.unwrap();

    // Two keystrokes inside the throttle window: one active broadcast
    let signal = signals.recv().await.unwrap();
    assert!(signal.active);
    assert_eq!(signal.user_id, f.alice.id);

    wait_for(&mut b_watch, |s| s.typing_users.contains(&f.alice.id)).await;

    // No further input: the idle deadline broadcasts an explicit stop
    let signal = timeout(Duration::from_secs(10), signals.recv())
        .await
        .expect("stop in time")
        .unwrap();
    assert!(!signal.active);
    assert_eq!(signal.user_id, f.alice.id);

    wait_for(&mut b_watch, |s| s.typing_users.is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn presence_follows_heartbeat_freshness() {
    let f = fixture();
    let mut alice = connect(&f.backend, f.alice.id).await;

    let conversation = alice.find_or_create_direct(f.bob.id).await.unwrap();
    let a = alice.open(conversation.id).await.unwrap();
    let mut a_watch = a.watch();

    // Bob's heartbeat is fresh: the next poll shows him online
    wait_for(&mut a_watch, |s| {
        s.online_users.iter().any(|p| p.id == f.bob.id)
    })
    .await;

    // Stale heartbeat: the next poll drops him
    let mut stale = f.bob.clone();
    stale.last_active = Utc::now() - chrono::Duration::minutes(6);
    f.backend.upsert_profile(stale);

    wait_for(&mut a_watch, |s| s.online_users.is_empty()).await;
}

#[tokio::test]
async fn direct_conversation_is_idempotent_in_both_orders() {
    let f = fixture();
    let alice = connect(&f.backend, f.alice.id).await;
    let bob = connect(&f.backend, f.bob.id).await;

    let first = alice.find_or_create_direct(f.bob.id).await.unwrap();
    let second = alice.find_or_create_direct(f.bob.id).await.unwrap();
    assert_eq!(first.id, second.id);

    // Same pair from the other side resolves to the same conversation
    let mirrored = bob.find_or_create_direct(f.alice.id).await.unwrap();
    assert_eq!(first.id, mirrored.id);

    // Concurrent calls from one session serialize instead of duplicating
    let (x, y) = tokio::join!(
        alice.directory().find_or_create_direct(f.alice.id, f.bob.id),
        alice.directory().find_or_create_direct(f.bob.id, f.alice.id),
    );
    assert_eq!(x.unwrap().id, first.id);
    assert_eq!(y.unwrap().id, first.id);

    assert_eq!(alice.list_conversations().await.unwrap().len(), 1);
}

#[tokio::test]
async fn cascade_delete_leaves_no_rows() {
    let f = fixture();
    let mut alice = connect(&f.backend, f.alice.id).await;
    let conversation = alice.find_or_create_direct(f.bob.id).await.unwrap();

    let store = f.backend.session(f.alice.id);
    for i in 0..5 {
        store
            .insert_message(NewMessage {
                id: MessageId::new(),
                conversation_id: conversation.id,
                sender_id: f.alice.id,
                content: format!("m{i}"),
                media: None,
            })
            .await
            .unwrap();
    }

    alice.delete_conversation(conversation.id).await.unwrap();

    assert!(matches!(
        store.conversation(conversation.id).await,
        Err(ChatError::NotFound)
    ));
    assert!(matches!(
        store.messages(conversation.id, None).await,
        Err(ChatError::NotFound)
    ));
    assert!(alice.list_conversations().await.unwrap().is_empty());

    // A later open of the dead conversation surfaces NotFound
    assert!(matches!(
        alice.open(conversation.id).await,
        Err(ChatError::NotFound)
    ));
}

#[tokio::test]
async fn closed_view_rejects_commands_but_send_still_lands() {
    let f = fixture();
    let mut alice = connect(&f.backend, f.alice.id).await;
    let conversation = alice.find_or_create_direct(f.bob.id).await.unwrap();

    let a = alice.open(conversation.id).await.unwrap();
    a.send("parting shot", None).await.unwrap();
    assert!(alice.close(conversation.id));

    // Teardown completes asynchronously; once it has, the scope takes no
    // more commands
    let mut closed = false;
    for _ in 0..100 {
        if matches!(a.input_changed().await, Err(ChatError::Closed)) {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(closed);
    assert!(matches!(a.send("too late", None).await, Err(ChatError::Closed)));

    // The in-flight persist still completes server-side; only the local
    // scope's state is gone
    let store = f.backend.session(f.alice.id);
    let mut rows = Vec::new();
    for _ in 0..100 {
        rows = store.messages(conversation.id, None).await.unwrap();
        if !rows.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].content, "parting shot");
}

#[tokio::test]
async fn access_control_is_enforced() {
    let f = fixture();
    let carol = profile("carol");
    f.backend.upsert_profile(carol.clone());

    let mut alice = connect(&f.backend, f.alice.id).await;
    let mut carol_client = connect(&f.backend, carol.id).await;

    let conversation = alice.find_or_create_direct(f.bob.id).await.unwrap();

    // Not a participant: no opening, no deleting, no creating on behalf of
    // other users, no self-conversations
    assert!(matches!(
        carol_client.open(conversation.id).await,
        Err(ChatError::PermissionDenied)
    ));
    assert!(matches!(
        carol_client.delete_conversation(conversation.id).await,
        Err(ChatError::PermissionDenied)
    ));
    assert!(matches!(
        carol_client
            .directory()
            .find_or_create_direct(f.alice.id, f.bob.id)
            .await,
        Err(ChatError::PermissionDenied)
    ));
    assert!(matches!(
        carol_client.find_or_create_direct(carol.id).await,
        Err(ChatError::InvalidArgument(_))
    ));

    // The community room is not deletable
    assert!(matches!(
        alice.delete_conversation(ConversationId::community()).await,
        Err(ChatError::PermissionDenied)
    ));

    // No session, no client
    assert!(matches!(
        ChatClient::connect(Services::from_backend(f.backend.clone())).await,
        Err(ChatError::Unauthenticated)
    ));
}
