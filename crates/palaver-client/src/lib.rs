//! # palaver-client
//!
//! Client-side real-time messaging engine: conversation directory, message
//! synchronization with optimistic sends, typing indicators, read receipts,
//! presence derivation, and the per-conversation session tasks that tie
//! them together.  The hosted backend is reached exclusively through the
//! `palaver-backend` trait interfaces.

pub mod directory;
pub mod presence;
pub mod session;
pub mod sync;
pub mod typing;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use palaver_backend::{ConversationStore, ProfileService, Realtime};
use palaver_shared::constants::HEARTBEAT_INTERVAL;
use palaver_shared::models::Conversation;
use palaver_shared::types::{ConversationId, UserId};
use palaver_shared::Result;

pub use directory::{ConversationDirectory, ConversationPreview};
pub use presence::PresenceTracker;
pub use session::{ChatHandle, ChatSessions, ChatSnapshot, SessionNotification};
pub use sync::{ChatEntry, MessageList, Reconciliation};

/// Shared handles to the backend collaborators.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn ConversationStore>,
    pub profiles: Arc<dyn ProfileService>,
    pub realtime: Arc<dyn Realtime>,
}

impl Services {
    /// Bundle one backend implementation that provides all three
    /// interfaces.
    pub fn from_backend<B>(backend: B) -> Self
    where
        B: ConversationStore + ProfileService + Realtime + Clone + 'static,
    {
        Self {
            store: Arc::new(backend.clone()),
            profiles: Arc::new(backend.clone()),
            realtime: Arc::new(backend),
        }
    }
}

/// One authenticated client: the conversation directory, the set of open
/// conversation views, and the heartbeat task.
pub struct ChatClient {
    user: UserId,
    directory: ConversationDirectory,
    sessions: ChatSessions,
    heartbeat: JoinHandle<()>,
}

impl ChatClient {
    /// Connect as the backend's authenticated user and start the heartbeat.
    /// Fails with `ChatError::Unauthenticated` when the profile service has
    /// no session.
    pub async fn connect(services: Services) -> Result<Self> {
        let user = services.profiles.current_user().await?;

        let presence = PresenceTracker::new(services.profiles.clone(), user);
        let heartbeat = tokio::spawn(async move {
            let mut tick = interval(HEARTBEAT_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                presence.heartbeat().await;
            }
        });

        info!(user = %user, "Chat client connected");
        Ok(Self {
            user,
            directory: ConversationDirectory::new(services.clone(), user),
            sessions: ChatSessions::new(services, user),
            heartbeat,
        })
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn directory(&self) -> &ConversationDirectory {
        &self.directory
    }

    /// The direct conversation with `other`, created on first use.
    pub async fn find_or_create_direct(&self, other: UserId) -> Result<Conversation> {
        self.directory.find_or_create_direct(self.user, other).await
    }

    /// The local user's conversation list, annotated for rendering.
    pub async fn list_conversations(&self) -> Result<Vec<ConversationPreview>> {
        self.directory.list_conversations(self.user).await
    }

    /// Open a conversation view.
    pub async fn open(&mut self, conversation: ConversationId) -> Result<ChatHandle> {
        self.sessions.open(conversation).await
    }

    /// Close a conversation view.
    pub fn close(&mut self, conversation: ConversationId) -> bool {
        self.sessions.close(conversation)
    }

    pub fn sessions(&self) -> &ChatSessions {
        &self.sessions
    }

    /// Delete a conversation, closing its view first if it is open.
    pub async fn delete_conversation(&mut self, conversation: ConversationId) -> Result<()> {
        self.sessions.close(conversation);
        self.directory.delete_conversation(conversation).await
    }

    /// Close every open view and stop the heartbeat.
    pub fn shutdown(&mut self) {
        self.sessions.shutdown();
        self.heartbeat.abort();
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

/// Install the default tracing subscriber for binaries and tests.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("palaver_client=debug,palaver_backend=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
