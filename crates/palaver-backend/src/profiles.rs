use async_trait::async_trait;

use palaver_shared::models::Profile;
use palaver_shared::types::UserId;
use palaver_shared::Result;

/// Identity/profile service consumed by the messaging core.
///
/// Implementations talk to the hosted identity backend; the core only ever
/// reads profile snapshots and writes the local user's heartbeat.
#[async_trait]
pub trait ProfileService: Send + Sync {
    /// Id of the authenticated user behind this handle, or
    /// `ChatError::Unauthenticated` when there is no session.
    async fn current_user(&self) -> Result<UserId>;

    /// Fetch a single profile snapshot.
    async fn profile(&self, user: UserId) -> Result<Profile>;

    /// Fetch a batch of profile snapshots.  Unknown ids are skipped rather
    /// than failing the whole batch.
    async fn profiles(&self, users: &[UserId]) -> Result<Vec<Profile>>;

    /// Write `last_active = now` for the given user.
    async fn touch_last_active(&self, user: UserId) -> Result<()>;
}
