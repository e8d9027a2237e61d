//! Online-presence derivation from heartbeat freshness.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use palaver_backend::ProfileService;
use palaver_shared::constants::ONLINE_WINDOW_MINUTES;
use palaver_shared::models::Profile;
use palaver_shared::types::UserId;
use palaver_shared::Result;

/// Profiles whose heartbeat is fresher than `window`.
pub fn online_subset(profiles: Vec<Profile>, now: DateTime<Utc>, window: Duration) -> Vec<Profile> {
    profiles
        .into_iter()
        .filter(|p| now - p.last_active < window)
        .collect()
}

/// Merge a freshly fetched online set into the previously displayed one
/// without reshuffling: entries already shown keep their relative order,
/// newcomers append, absentees drop.  Pure display stability; the
/// underlying query has no ordering of its own.
pub fn refresh_online_list(previous: &[Profile], fetched: Vec<Profile>) -> Vec<Profile> {
    let mut merged: Vec<Profile> = Vec::with_capacity(fetched.len());
    for shown in previous {
        if let Some(fresh) = fetched.iter().find(|f| f.id == shown.id) {
            merged.push(fresh.clone());
        }
    }
    for profile in fetched {
        if !merged.iter().any(|m| m.id == profile.id) {
            merged.push(profile);
        }
    }
    merged
}

/// Heartbeat writer and online-set computation for one client.
pub struct PresenceTracker {
    profiles: Arc<dyn ProfileService>,
    user: UserId,
}

impl PresenceTracker {
    pub fn new(profiles: Arc<dyn ProfileService>, user: UserId) -> Self {
        Self { profiles, user }
    }

    /// Write the local user's heartbeat.  Best-effort: presence self-heals
    /// on the next write, so failures are logged and dropped.
    pub async fn heartbeat(&self) {
        if let Err(e) = self.profiles.touch_last_active(self.user).await {
            warn!(user = %self.user, error = %e, "Heartbeat write failed");
        }
    }

    /// Profiles among `users` that are currently online.
    pub async fn online_among(&self, users: &[UserId]) -> Result<Vec<Profile>> {
        let fetched = self.profiles.profiles(users).await?;
        Ok(online_subset(
            fetched,
            Utc::now(),
            Duration::minutes(ONLINE_WINDOW_MINUTES),
        ))
    }
}
