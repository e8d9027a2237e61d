use async_trait::async_trait;
use tokio::sync::broadcast;

use palaver_shared::models::MessageRow;
use palaver_shared::protocol::{ReadReceipt, TypingSignal};
use palaver_shared::types::ConversationId;
use palaver_shared::Result;

/// Publish/subscribe transport.
///
/// Feeds are per-conversation topics: delivery is at-least-once and ordered
/// within a topic, with no ordering across topics.  Ephemeral broadcasts
/// carry no persistence guarantee, and publishing them is best-effort.
/// Dropping a receiver is the unsubscribe.
#[async_trait]
pub trait Realtime: Send + Sync {
    /// Row-change feed of messages inserted into the conversation.
    fn message_feed(&self, conversation: ConversationId) -> broadcast::Receiver<MessageRow>;

    /// Ephemeral typing-indicator topic.
    fn typing_feed(&self, conversation: ConversationId) -> broadcast::Receiver<TypingSignal>;

    /// Ephemeral read-receipt topic.
    fn receipt_feed(&self, conversation: ConversationId) -> broadcast::Receiver<ReadReceipt>;

    async fn publish_typing(&self, signal: TypingSignal) -> Result<()>;

    async fn publish_receipt(&self, receipt: ReadReceipt) -> Result<()>;
}
